//! Kubernetes operations on MeshInstallation resources and cluster nodes

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams};
use kube::discovery::ApiResource;
use kube::Client;
use serde_json::json;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use meshkeeper_common::crd::{MeshInstallation, MeshInstallationStatus};
use meshkeeper_common::{Error, LAST_APPLIED_CONFIGURATION_ANNOTATION};
use meshkeeper_config::gateway_host;

/// Namespace of the Istio Gateway that fronts the cluster's domain
pub const CLUSTER_GATEWAY_NAMESPACE: &str = "kyma-system";

/// Name of the Istio Gateway that fronts the cluster's domain
pub const CLUSTER_GATEWAY_NAME: &str = "kyma-gateway";

/// Trait abstracting the Kubernetes client for the MeshInstallation controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// All nodes of the cluster, used for sizing and flavour discovery
    async fn list_nodes(&self) -> Result<Vec<Node>, Error>;

    /// Replace the status of a MeshInstallation
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &MeshInstallationStatus,
    ) -> Result<(), Error>;

    /// Store the last applied configuration annotation
    async fn record_applied(&self, namespace: &str, name: &str, applied: &str)
        -> Result<(), Error>;

    /// First host served by the cluster Gateway
    async fn gateway_host(&self) -> Result<String, Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn installations(&self, namespace: &str) -> Api<MeshInstallation> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn list_nodes(&self) -> Result<Vec<Node>, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api.list(&ListParams::default()).await?;
        debug!(count = nodes.items.len(), "listed nodes");
        Ok(nodes.items)
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &MeshInstallationStatus,
    ) -> Result<(), Error> {
        let patch = json!({ "status": status });
        self.installations(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        debug!(namespace, name, state = ?status.state, "patched status");
        Ok(())
    }

    async fn record_applied(
        &self,
        namespace: &str,
        name: &str,
        applied: &str,
    ) -> Result<(), Error> {
        let patch = json!({
            "metadata": {
                "annotations": {
                    LAST_APPLIED_CONFIGURATION_ANNOTATION: applied,
                }
            }
        });
        self.installations(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        debug!(namespace, name, "recorded last applied configuration");
        Ok(())
    }

    async fn gateway_host(&self) -> Result<String, Error> {
        let gateways: Api<DynamicObject> = Api::namespaced_with(
            self.client.clone(),
            CLUSTER_GATEWAY_NAMESPACE,
            &ApiResource::from_gvk(&GroupVersionKind::gvk(
                "networking.istio.io",
                "v1alpha3",
                "Gateway",
            )),
        );
        let gateway = gateways.get(CLUSTER_GATEWAY_NAME).await?;
        let host = gateway_host(&gateway.data)?;
        debug!(%host, "resolved cluster gateway host");
        Ok(host)
    }
}
