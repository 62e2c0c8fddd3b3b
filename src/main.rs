use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use eyre::WrapErr as _;
use kita::{
    config::Settings,
    controller::{spawn_watchers, trigger_queue, ReconcileController},
    http_client,
    orchestrator::CertificateOrchestrator,
    responder::{self, ChallengeResponder},
    solver::ChallengeSolver,
    store::KubeStore,
    AcmeService, DirectoryCache,
};

/// Issues and renews TLS certificates for labelled Ingresses.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Settings file; `KITA__*` environment variables override its values.
    #[arg(short, long, env = "KITA_CONFIG")]
    config: Option<PathBuf>,

    /// Report missing or expiring certificates without ordering new ones.
    #[arg(long)]
    dry_run: bool,

    /// Use this issuer for every Ingress.
    #[arg(long)]
    override_issuer: Option<String>,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let args = Args::parse();

    let mut settings = Settings::load(args.config.as_deref())?;
    settings.dry_run |= args.dry_run;
    if args.override_issuer.is_some() {
        settings.override_issuer = args.override_issuer;
    }
    settings.validate()?;

    if settings.dry_run {
        log::warn!("dry run: certificates will not be ordered");
    }

    let kube = kube::Client::try_default()
        .await
        .wrap_err("failed to create Kubernetes client")?;
    let store = KubeStore::new(kube, settings.namespace.clone());
    log::info!("watching namespace {}", store.namespace());

    let http = http_client(&settings)?;
    let directories = Arc::new(
        DirectoryCache::load(&settings.issuers, http)
            .await
            .wrap_err("failed to load ACME directories")?,
    );
    let acme = Arc::new(AcmeService::new(directories, settings.issuers.clone()));

    let responder = Arc::new(ChallengeResponder::new());
    let server = responder::serve(Arc::clone(&responder), settings.responder_bind.as_str())
        .wrap_err_with(|| format!("failed to bind {}", settings.responder_bind))?;
    let server_handle = server.handle();
    tokio::spawn(server);

    let store = Arc::new(store);
    let solver = ChallengeSolver::new(
        store.clone(),
        responder,
        settings.solver_role.clone(),
        settings.solver_ready_timeout(),
    );
    let orchestrator = Arc::new(CertificateOrchestrator::new(acme, solver, &settings));

    let (triggers_tx, triggers_rx) = trigger_queue();
    let watchers = spawn_watchers(&store, &settings, triggers_tx.clone());
    let controller = Arc::new(ReconcileController::new(
        store,
        orchestrator,
        triggers_tx,
        &settings,
    ));

    tokio::select! {
        _ = controller.run(triggers_rx, settings.renewal_check_interval()) => {}
        res = tokio::signal::ctrl_c() => {
            res?;
            log::info!("shutting down");
        }
    }

    for watcher in watchers {
        watcher.abort();
    }
    server_handle.stop(true).await;

    Ok(())
}
