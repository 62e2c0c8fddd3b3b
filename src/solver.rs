//! Temporary routes that expose `http-01` key authorizations to the ACME server.
//!
//! A route goes through these states: the token is registered with the [`ChallengeResponder`], a
//! solver Ingress sends the token's well-known path to the responder Service, and once the
//! Ingress is reachable the caller asks the CA to validate and waits for its probe. Whatever the
//! outcome, [`ChallengeSolver::cleanup()`] removes the Ingress and the token.

use std::{collections::BTreeMap, fmt::Write as _, sync::Arc, time::Duration};

use k8s_openapi::{
    api::{
        core::v1::{Service, ServicePort},
        networking::v1::{
            HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
            IngressServiceBackend, IngressSpec, ServiceBackendPort,
        },
    },
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use sha2::{Digest as _, Sha256};
use tokio::sync::oneshot;

use crate::{
    error::{Error, Result},
    metadata::{
        solver_service_selector, HOST_ANNOTATION, ISSUER_LABEL, ROLE_LABEL,
        SOLVER_SERVICE_PORT_NAME,
    },
    responder::{ChallengeResponder, CHALLENGE_PATH_PREFIX},
    store::ResourceStore,
};

/// A challenge to expose.
#[derive(Debug, Clone, Copy)]
pub struct ChallengeRequest<'a> {
    pub issuer_id: &'a str,
    pub host: &'a str,

    /// Class of the Ingress the certificate is for; the solver Ingress uses the same one.
    pub ingress_class: Option<&'a str>,

    pub token: &'a str,
    pub key_authorization: &'a str,
}

/// A live route for one token.
#[derive(Debug)]
pub struct SolverRoute {
    ingress_name: String,
    token: String,
    probe: oneshot::Receiver<()>,
}

impl SolverRoute {
    /// Waits until the ACME server fetched the key authorization.
    pub async fn wait_for_probe(&mut self, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, &mut self.probe).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::solver(format!(
                "challenge token {} was unregistered while waiting",
                self.token
            ))),
            Err(_) => Err(Error::ChallengeProbeTimeout(self.token.clone())),
        }
    }
}

pub struct ChallengeSolver {
    store: Arc<dyn ResourceStore>,
    responder: Arc<ChallengeResponder>,
    solver_role: String,
    ready_timeout: Duration,
}

impl ChallengeSolver {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        responder: Arc<ChallengeResponder>,
        solver_role: String,
        ready_timeout: Duration,
    ) -> Self {
        ChallengeSolver {
            store,
            responder,
            solver_role,
            ready_timeout,
        }
    }

    /// Registers the token and routes its well-known path to the responder Service.
    ///
    /// Returns once the route is reachable. On failure everything set up so far is removed again.
    pub async fn prepare(&self, req: ChallengeRequest<'_>) -> Result<SolverRoute> {
        let probe = self
            .responder
            .register(req.token, req.key_authorization.to_owned());

        let mut applied = None;

        match self.route(req, &mut applied).await {
            Ok(ingress_name) => Ok(SolverRoute {
                ingress_name,
                token: req.token.to_owned(),
                probe,
            }),
            Err(err) => {
                if let Some(ingress_name) = applied {
                    self.delete_route(&ingress_name).await;
                }
                self.responder.unregister(req.token);

                Err(err)
            }
        }
    }

    /// Removes the route's Ingress and stops answering for its token.
    pub async fn cleanup(&self, route: SolverRoute) {
        self.delete_route(&route.ingress_name).await;
        self.responder.unregister(&route.token);
    }

    async fn route(
        &self,
        req: ChallengeRequest<'_>,
        applied: &mut Option<String>,
    ) -> Result<String> {
        let selector = solver_service_selector(&self.solver_role);
        let service = self
            .store
            .find_service(&selector)
            .await?
            .ok_or_else(|| Error::solver(format!("no service matches {selector}")))?;

        let service_name = service
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::solver("solver service has no name"))?;
        let port = backend_port(&service)?;

        let ingress_name = solver_ingress_name(&service_name, req.host, req.token);
        let ingress = solver_ingress(&ingress_name, &service_name, port, &self.solver_role, req);

        log::debug!(
            "routing challenge for {} through ingress {ingress_name}",
            req.host
        );

        self.store.apply_ingress(&ingress_name, ingress).await?;
        *applied = Some(ingress_name.clone());

        self.store
            .await_ingress_address(&ingress_name, self.ready_timeout)
            .await?;

        Ok(ingress_name)
    }

    async fn delete_route(&self, ingress_name: &str) {
        if let Err(err) = self.store.delete_ingress(ingress_name).await {
            log::warn!("failed to delete solver ingress {ingress_name}: {err}");
        }
    }
}

/// `<service>-solver-<host>-<token digest>`; the digest keeps concurrent routes for one host apart.
fn solver_ingress_name(service_name: &str, host: &str, token: &str) -> String {
    let mut name = format!(
        "{service_name}-solver-{}-",
        host.to_lowercase().replace(['.', '*'], "-")
    );

    for byte in &Sha256::digest(token.as_bytes())[..4] {
        let _ = write!(name, "{byte:02x}");
    }

    name
}

/// The Service's only port, or else its port named `http`.
fn backend_port(service: &Service) -> Result<ServiceBackendPort> {
    let ports = service
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_deref())
        .unwrap_or_default();

    let port = match ports {
        [] => return Err(Error::solver("solver service exposes no ports")),
        [port] => port,
        ports => ports
            .iter()
            .find(|port| port.name.as_deref() == Some(SOLVER_SERVICE_PORT_NAME))
            .ok_or_else(|| {
                Error::solver(format!(
                    "solver service has several ports but none named {SOLVER_SERVICE_PORT_NAME}"
                ))
            })?,
    };

    Ok(to_backend_port(port))
}

fn to_backend_port(port: &ServicePort) -> ServiceBackendPort {
    match &port.name {
        Some(name) => ServiceBackendPort {
            name: Some(name.clone()),
            number: None,
        },
        None => ServiceBackendPort {
            name: None,
            number: Some(port.port),
        },
    }
}

fn solver_ingress(
    name: &str,
    service_name: &str,
    port: ServiceBackendPort,
    solver_role: &str,
    req: ChallengeRequest<'_>,
) -> Ingress {
    Ingress {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            labels: Some(BTreeMap::from([
                (ROLE_LABEL.to_owned(), solver_role.to_owned()),
                (ISSUER_LABEL.to_owned(), req.issuer_id.to_owned()),
            ])),
            annotations: Some(BTreeMap::from([(
                HOST_ANNOTATION.to_owned(),
                req.host.to_owned(),
            )])),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            ingress_class_name: req.ingress_class.map(ToOwned::to_owned),
            rules: Some(vec![IngressRule {
                host: Some(req.host.to_owned()),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some(format!("{CHALLENGE_PATH_PREFIX}{}", req.token)),
                        path_type: "Exact".to_owned(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: service_name.to_owned(),
                                port: Some(port),
                            }),
                            resource: None,
                        },
                    }],
                }),
            }]),
            ..Default::default()
        }),
        status: None,
    }
}
