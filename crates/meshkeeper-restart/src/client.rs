//! Kubernetes client for the workloads behind injected pods
//!
//! Restarters talk to the cluster only through [`WorkloadClient`], so tests
//! can mock every lookup and mutation.

use std::fmt::Debug;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use meshkeeper_common::{Error, RESTARTED_AT_ANNOTATION};

use crate::workload::{WorkloadKind, WorkloadRef};

/// Page size when listing every running pod in the cluster
pub const POD_LIST_PAGE_SIZE: u32 = 100;

/// Cluster operations needed to restart proxies
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkloadClient: Send + Sync {
    /// All pods in the cluster that are running, fetched page by page
    async fn list_running_pods(&self) -> Result<Vec<Pod>, Error>;

    /// Pods in `namespace` matching a label selector
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>, Error>;

    /// A ReplicaSet by name, `None` if it does not exist
    async fn get_replica_set(&self, namespace: &str, name: &str)
        -> Result<Option<ReplicaSet>, Error>;

    /// All ReplicaSets in `namespace`
    async fn list_replica_sets(&self, namespace: &str) -> Result<Vec<ReplicaSet>, Error>;

    /// Trigger a rolling restart by stamping the pod template
    async fn rollout(&self, workload: &WorkloadRef) -> Result<(), Error>;

    /// Delete a single pod
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// Merge patch that sets the restart annotation on a pod template
pub fn rollout_patch(restarted_at: &str) -> Value {
    json!({
        "spec": {
            "template": {
                "metadata": {
                    "annotations": {
                        RESTARTED_AT_ANNOTATION: restarted_at,
                    }
                }
            }
        }
    })
}

/// [`WorkloadClient`] backed by the Kubernetes API
pub struct KubeWorkloadClient {
    client: Client,
}

impl KubeWorkloadClient {
    /// Create a client on top of a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn patch_template<K>(&self, namespace: &str, name: &str, patch: &Value) -> Result<(), Error>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        api.patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl WorkloadClient for KubeWorkloadClient {
    async fn list_running_pods(&self) -> Result<Vec<Pod>, Error> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let mut params = ListParams::default()
            .fields("status.phase=Running")
            .limit(POD_LIST_PAGE_SIZE);
        let mut pods = Vec::new();
        loop {
            let page = api.list(&params).await?;
            pods.extend(page.items);
            match page.metadata.continue_ {
                Some(token) if !token.is_empty() => params = params.continue_token(&token),
                _ => break,
            }
        }
        debug!(count = pods.len(), "listed running pods");
        Ok(pods)
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(pods.items)
    }

    async fn get_replica_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ReplicaSet>, Error> {
        let api: Api<ReplicaSet> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_replica_sets(&self, namespace: &str) -> Result<Vec<ReplicaSet>, Error> {
        let api: Api<ReplicaSet> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn rollout(&self, workload: &WorkloadRef) -> Result<(), Error> {
        let patch = rollout_patch(&Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true));
        let (namespace, name) = (workload.namespace.as_str(), workload.name.as_str());
        match workload.kind {
            WorkloadKind::Deployment => {
                self.patch_template::<Deployment>(namespace, name, &patch)
                    .await?
            }
            WorkloadKind::DaemonSet => {
                self.patch_template::<DaemonSet>(namespace, name, &patch)
                    .await?
            }
            WorkloadKind::StatefulSet => {
                self.patch_template::<StatefulSet>(namespace, name, &patch)
                    .await?
            }
            WorkloadKind::ReplicaSet => {
                self.patch_template::<ReplicaSet>(namespace, name, &patch)
                    .await?
            }
            kind => {
                return Err(Error::restart(
                    workload.to_string(),
                    format!("rollout is not supported for kind {}", kind.as_str()),
                ))
            }
        }
        info!(kind = workload.kind.as_str(), %workload, "rolled out workload");
        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(response)) if response.code == 404 => {
                debug!(namespace, pod = name, "pod already gone");
            }
            Err(e) => return Err(e.into()),
        }
        info!(namespace, pod = name, "deleted pod");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollout_patch_stamps_pod_template() {
        let patch = rollout_patch("2024-05-01T10:00:00Z");
        assert_eq!(
            patch["spec"]["template"]["metadata"]["annotations"][RESTARTED_AT_ANNOTATION],
            "2024-05-01T10:00:00Z"
        );
        assert!(patch["metadata"].is_null());
    }
}
