use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::{
    core::v1::{Secret, Service},
    networking::v1::Ingress,
};
use kube::{
    api::{DeleteParams, ListParams, Patch, PatchParams},
    runtime::wait::await_condition,
    Api, Client,
};
#[cfg(test)]
use mockall::automock;

use crate::error::{Error, Result};

const FIELD_MANAGER: &str = "kita";

/// Kubernetes operations the controller and the challenge solver need.
///
/// All resources live in a single namespace.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Ingresses matching a label selector.
    async fn list_ingresses(&self, selector: &str) -> Result<Vec<Ingress>>;

    async fn get_secret(&self, name: &str) -> Result<Option<Secret>>;

    /// Creates or replaces a Secret.
    async fn apply_secret(&self, name: &str, secret: Secret) -> Result<()>;

    /// First Service matching a label selector.
    async fn find_service(&self, selector: &str) -> Result<Option<Service>>;

    /// Creates or replaces an Ingress.
    async fn apply_ingress(&self, name: &str, ingress: Ingress) -> Result<()>;

    /// Waits until the Ingress reports a load-balancer address.
    async fn await_ingress_address(&self, name: &str, timeout: Duration) -> Result<()>;

    /// Deletes an Ingress; one that is already gone is not an error.
    async fn delete_ingress(&self, name: &str) -> Result<()>;
}

/// [`ResourceStore`] backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    namespace: String,
}

impl KubeStore {
    /// Operates in `namespace`, or in the client's default namespace.
    pub fn new(client: Client, namespace: Option<String>) -> Self {
        let namespace = namespace.unwrap_or_else(|| client.default_namespace().to_owned());
        KubeStore { client, namespace }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub(crate) fn ingresses(&self) -> Api<Ingress> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    pub(crate) fn secrets(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn services(&self) -> Api<Service> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

/// True once the load balancer has published at least one address.
pub(crate) fn has_load_balancer_address(ingress: &Ingress) -> bool {
    ingress
        .status
        .as_ref()
        .and_then(|status| status.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .is_some_and(|addresses| !addresses.is_empty())
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn list_ingresses(&self, selector: &str) -> Result<Vec<Ingress>> {
        let list = self
            .ingresses()
            .list(&ListParams::default().labels(selector))
            .await?;
        Ok(list.items)
    }

    async fn get_secret(&self, name: &str) -> Result<Option<Secret>> {
        Ok(self.secrets().get_opt(name).await?)
    }

    async fn apply_secret(&self, name: &str, secret: Secret) -> Result<()> {
        self.secrets()
            .patch(
                name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&secret),
            )
            .await?;
        Ok(())
    }

    async fn find_service(&self, selector: &str) -> Result<Option<Service>> {
        let mut services = self
            .services()
            .list(&ListParams::default().labels(selector))
            .await?
            .items;

        if services.len() > 1 {
            log::warn!("several services match {selector}, using the first");
        }

        Ok(if services.is_empty() {
            None
        } else {
            Some(services.swap_remove(0))
        })
    }

    async fn apply_ingress(&self, name: &str, ingress: Ingress) -> Result<()> {
        self.ingresses()
            .patch(
                name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&ingress),
            )
            .await?;
        Ok(())
    }

    async fn await_ingress_address(&self, name: &str, timeout: Duration) -> Result<()> {
        let ready = await_condition(self.ingresses(), name, |ingress: Option<&Ingress>| {
            ingress.is_some_and(has_load_balancer_address)
        });

        match tokio::time::timeout(timeout, ready).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) => Err(Error::solver(format!(
                "watching ingress {name} failed: {err}"
            ))),
            Err(_) => Err(Error::solver(format!(
                "ingress {name} got no load balancer address within {timeout:?}"
            ))),
        }
    }

    async fn delete_ingress(&self, name: &str) -> Result<()> {
        match self.ingresses().delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::networking::v1::{
        IngressLoadBalancerIngress, IngressLoadBalancerStatus, IngressStatus,
    };

    use super::*;

    fn ingress_with(addresses: Option<Vec<IngressLoadBalancerIngress>>) -> Ingress {
        Ingress {
            status: Some(IngressStatus {
                load_balancer: Some(IngressLoadBalancerStatus { ingress: addresses }),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn address_is_required_for_readiness() {
        assert!(!has_load_balancer_address(&Ingress::default()));
        assert!(!has_load_balancer_address(&ingress_with(None)));
        assert!(!has_load_balancer_address(&ingress_with(Some(vec![]))));

        let ready = ingress_with(Some(vec![IngressLoadBalancerIngress {
            ip: Some("10.0.0.1".to_owned()),
            ..Default::default()
        }]));
        assert!(has_load_balancer_address(&ready));
    }
}
