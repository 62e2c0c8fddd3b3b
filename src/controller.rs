//! Keeps the TLS secrets of labelled Ingresses issued and fresh.
//!
//! Every source of work (Ingress and Secret watches, the periodic sweep and renewal timers) feeds
//! one [`Trigger`] queue consumed by [`ReconcileController::run()`]. Reconciles run as separate
//! tasks, at most one per Ingress name at a time.

use std::{collections::HashSet, pin::pin, sync::Arc, time::Duration};

use futures::StreamExt as _;
use k8s_openapi::{
    api::{core::v1::Secret, networking::v1::Ingress},
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use kube::runtime::{watcher, WatchStreamExt as _};
use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio::{sync::mpsc, task::JoinHandle, time::MissedTickBehavior};

use crate::{
    config::Settings,
    error::Result,
    metadata::{managed_ingress_selector, managed_secret_selector, ISSUER_LABEL, TLS_CERT_KEY},
    orchestrator::{render_tls_secret, CertificateIssuer, IssueRequest},
    renewal::{evaluate, RenewalDecision, RenewalScheduler},
    store::{KubeStore, ResourceStore},
};

const TRIGGER_QUEUE_SIZE: usize = 256;

/// A reason to look at Ingresses again.
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    IngressApplied(Box<Ingress>),
    SecretApplied(Box<Secret>),
    SecretDeleted(String),

    /// Periodic pass over every managed Ingress.
    Sweep,

    /// A scheduled renewal check for the named secret.
    RenewalDue(String),
}

/// Creates the trigger queue shared by watches, timers and the controller loop.
pub fn trigger_queue() -> (mpsc::Sender<Trigger>, mpsc::Receiver<Trigger>) {
    mpsc::channel(TRIGGER_QUEUE_SIZE)
}

/// Marks an Ingress as being reconciled until dropped.
struct ActiveReconcile {
    active: Arc<Mutex<HashSet<String>>>,
    name: String,
}

impl ActiveReconcile {
    fn acquire(active: &Arc<Mutex<HashSet<String>>>, name: &str) -> Option<Self> {
        if !active.lock().insert(name.to_owned()) {
            return None;
        }

        Some(ActiveReconcile {
            active: Arc::clone(active),
            name: name.to_owned(),
        })
    }
}

impl Drop for ActiveReconcile {
    fn drop(&mut self) {
        self.active.lock().remove(&self.name);
    }
}

/// A TLS entry of an Ingress.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TlsEntry {
    secret_name: String,
    hosts: Vec<String>,
}

fn tls_entries(ingress: &Ingress) -> Vec<TlsEntry> {
    let ingress_name = ingress.metadata.name.as_deref().unwrap_or_default();

    ingress
        .spec
        .iter()
        .flat_map(|spec| spec.tls.iter().flatten())
        .filter_map(|tls| {
            let hosts = tls.hosts.clone().unwrap_or_default();

            match &tls.secret_name {
                Some(secret_name) if !hosts.is_empty() => Some(TlsEntry {
                    secret_name: secret_name.clone(),
                    hosts,
                }),
                _ => {
                    log::warn!("ingress {ingress_name} has a TLS entry without secret or hosts");
                    None
                }
            }
        })
        .collect()
}

fn references_secret(ingress: &Ingress, secret_name: &str) -> bool {
    ingress
        .spec
        .iter()
        .flat_map(|spec| spec.tls.iter().flatten())
        .any(|tls| tls.secret_name.as_deref() == Some(secret_name))
}

fn label<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    meta.labels.as_ref()?.get(key).map(String::as_str)
}

fn certificate_data(secret: &Secret) -> Option<&[u8]> {
    secret
        .data
        .as_ref()?
        .get(TLS_CERT_KEY)
        .map(|data| data.0.as_slice())
}

pub struct ReconcileController {
    store: Arc<dyn ResourceStore>,
    issuer: Arc<dyn CertificateIssuer>,
    scheduler: RenewalScheduler,
    active: Arc<Mutex<HashSet<String>>>,
    dry_run: bool,
    override_issuer: Option<String>,
    ingress_selector: String,
}

impl ReconcileController {
    /// `triggers` receives scheduled renewal checks and must feed the queue passed to
    /// [`ReconcileController::run()`].
    pub fn new(
        store: Arc<dyn ResourceStore>,
        issuer: Arc<dyn CertificateIssuer>,
        triggers: mpsc::Sender<Trigger>,
        settings: &Settings,
    ) -> Self {
        ReconcileController {
            store,
            issuer,
            scheduler: RenewalScheduler::new(triggers),
            active: Arc::new(Mutex::new(HashSet::new())),
            dry_run: settings.dry_run,
            override_issuer: settings.override_issuer.clone(),
            ingress_selector: managed_ingress_selector(&settings.solver_role),
        }
    }

    pub fn scheduler(&self) -> &RenewalScheduler {
        &self.scheduler
    }

    /// Consumes triggers until the queue closes, sweeping all Ingresses every `sweep_interval`.
    pub async fn run(self: Arc<Self>, mut triggers: mpsc::Receiver<Trigger>, sweep_interval: Duration) {
        let mut sweep = tokio::time::interval(sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        log::info!("controller started");

        loop {
            tokio::select! {
                trigger = triggers.recv() => match trigger {
                    Some(trigger) => self.dispatch(trigger),
                    None => break,
                },

                _ = sweep.tick() => self.dispatch(Trigger::Sweep),
            }
        }

        log::info!("controller stopped");
    }

    /// Starts handling `trigger` without waiting for it.
    pub fn dispatch(self: &Arc<Self>, trigger: Trigger) {
        match trigger {
            Trigger::IngressApplied(ingress) => {
                self.try_reconcile(*ingress);
            }

            Trigger::SecretApplied(secret) => {
                let Some(name) = secret.metadata.name.clone() else {
                    return;
                };

                match evaluate(&name, certificate_data(&secret), OffsetDateTime::now_utc()) {
                    RenewalDecision::Due => self.spawn_recheck(name),
                    RenewalDecision::NotDue { check_at: Some(at) } => {
                        self.scheduler.schedule(&name, at)
                    }
                    RenewalDecision::NotDue { check_at: None } => {}
                }
            }

            Trigger::SecretDeleted(name) => {
                log::info!("TLS secret {name} was deleted");
                self.scheduler.cancel(&name);
                self.spawn_recheck(name);
            }

            Trigger::Sweep => {
                let this = Arc::clone(self);

                tokio::spawn(async move {
                    log::debug!("sweeping managed ingresses");

                    match this.store.list_ingresses(&this.ingress_selector).await {
                        Ok(ingresses) => {
                            for ingress in ingresses {
                                this.try_reconcile(ingress);
                            }
                        }
                        Err(err) => log::warn!("failed to list ingresses: {err}"),
                    }
                });
            }

            Trigger::RenewalDue(name) => {
                log::info!("renewal check due for TLS secret {name}");
                self.spawn_recheck(name);
            }
        }
    }

    /// Reconciles every managed Ingress that uses `secret_name`.
    fn spawn_recheck(self: &Arc<Self>, secret_name: String) {
        let this = Arc::clone(self);

        tokio::spawn(async move {
            let ingresses = match this.store.list_ingresses(&this.ingress_selector).await {
                Ok(ingresses) => ingresses,
                Err(err) => {
                    log::warn!("failed to list ingresses for secret {secret_name}: {err}");
                    return;
                }
            };

            for ingress in ingresses {
                if references_secret(&ingress, &secret_name) {
                    this.try_reconcile(ingress);
                }
            }
        });
    }

    /// Spawns a reconcile of `ingress` unless one is already running for its name.
    pub fn try_reconcile(self: &Arc<Self>, ingress: Ingress) -> Option<JoinHandle<()>> {
        let name = ingress.metadata.name.clone()?;

        let Some(guard) = ActiveReconcile::acquire(&self.active, &name) else {
            log::debug!("ingress {name} is already being reconciled");
            return None;
        };

        let this = Arc::clone(self);

        Some(tokio::spawn(async move {
            let _guard = guard;
            this.reconcile(&name, &ingress).await;
        }))
    }

    pub fn is_active(&self, ingress_name: &str) -> bool {
        self.active.lock().contains(ingress_name)
    }

    async fn reconcile(&self, name: &str, ingress: &Ingress) {
        let issuer_id = match self
            .override_issuer
            .as_deref()
            .or_else(|| label(&ingress.metadata, ISSUER_LABEL))
        {
            Some(issuer_id) => issuer_id.to_owned(),
            None => {
                log::warn!("ingress {name} names no issuer");
                return;
            }
        };

        let ingress_class = ingress
            .spec
            .as_ref()
            .and_then(|spec| spec.ingress_class_name.clone());

        for entry in tls_entries(ingress) {
            let req = IssueRequest {
                issuer_id: issuer_id.clone(),
                ingress_name: name.to_owned(),
                ingress_class: ingress_class.clone(),
                secret_name: entry.secret_name,
                hosts: entry.hosts,
            };

            if let Err(err) = self.process_tls_entry(req).await {
                log::warn!("failed to process TLS entry of ingress {name}: {err}");
            }
        }
    }

    async fn process_tls_entry(&self, req: IssueRequest) -> Result<()> {
        let secret_name = req.secret_name.as_str();
        let secret = self.store.get_secret(secret_name).await?;

        let reason = match &secret {
            None => "secret is missing",

            Some(secret) if label(&secret.metadata, ISSUER_LABEL) != Some(req.issuer_id.as_str()) => {
                "secret was issued by a different issuer"
            }

            Some(secret) => {
                match evaluate(secret_name, certificate_data(secret), OffsetDateTime::now_utc()) {
                    RenewalDecision::Due => "certificate is due for renewal",
                    RenewalDecision::NotDue { check_at } => {
                        if let Some(at) = check_at {
                            self.scheduler.schedule(secret_name, at);
                        }
                        return Ok(());
                    }
                }
            }
        };

        log::info!(
            "TLS secret {secret_name} of ingress {} needs a certificate: {reason}",
            req.ingress_name
        );

        if self.dry_run {
            log::info!("dry run, skipping certificate creation for {secret_name}");
            return Ok(());
        }

        let certificate = self.issuer.issue(req.clone()).await?;

        self.store
            .apply_secret(secret_name, render_tls_secret(&req, &certificate))
            .await?;

        log::info!("stored certificate in TLS secret {secret_name}");

        if let RenewalDecision::NotDue { check_at: Some(at) } = evaluate(
            secret_name,
            Some(certificate.certificate().as_bytes()),
            OffsetDateTime::now_utc(),
        ) {
            self.scheduler.schedule(secret_name, at);
        }

        Ok(())
    }
}

/// Forwards Ingress and Secret watch events into the trigger queue.
///
/// Watches are re-established with backoff after errors.
pub fn spawn_watchers(
    store: &KubeStore,
    settings: &Settings,
    triggers: mpsc::Sender<Trigger>,
) -> Vec<JoinHandle<()>> {
    let ingress_config =
        watcher::Config::default().labels(&managed_ingress_selector(&settings.solver_role));
    let ingresses = watcher::watcher(store.ingresses(), ingress_config).default_backoff();

    let secret_config = watcher::Config::default().labels(&managed_secret_selector());
    let secrets = watcher::watcher(store.secrets(), secret_config).default_backoff();

    let ingress_triggers = triggers.clone();

    vec![
        tokio::spawn(async move {
            let mut ingresses = pin!(ingresses);

            while let Some(event) = ingresses.next().await {
                let trigger = match event {
                    Ok(watcher::Event::Apply(ingress) | watcher::Event::InitApply(ingress)) => {
                        Trigger::IngressApplied(Box::new(ingress))
                    }
                    Ok(_) => continue,
                    Err(err) => {
                        log::error!("ingress watch failed, will retry: {err}");
                        continue;
                    }
                };

                if ingress_triggers.send(trigger).await.is_err() {
                    break;
                }
            }
        }),
        tokio::spawn(async move {
            let mut secrets = pin!(secrets);

            while let Some(event) = secrets.next().await {
                let trigger = match event {
                    Ok(watcher::Event::Apply(secret) | watcher::Event::InitApply(secret)) => {
                        Trigger::SecretApplied(Box::new(secret))
                    }
                    Ok(watcher::Event::Delete(secret)) => match secret.metadata.name {
                        Some(name) => Trigger::SecretDeleted(name),
                        None => continue,
                    },
                    Ok(_) => continue,
                    Err(err) => {
                        log::error!("secret watch failed, will retry: {err}");
                        continue;
                    }
                };

                if triggers.send(trigger).await.is_err() {
                    break;
                }
            }
        }),
    ]
}
