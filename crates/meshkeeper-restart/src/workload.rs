//! Pod inspection helpers and restart target resolution
//!
//! Everything here is pure: pods and ReplicaSets go in, decisions come out.
//! The Kubernetes calls live in [`crate::client`].

use std::fmt;

use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::{Container, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

use meshkeeper_common::{
    Error, ISTIO_PROXY_CONTAINER, ISTIO_SYSTEM_NAMESPACE, MANAGED_BY_LABEL_KEY,
};
use meshkeeper_config::IstioVersion;

/// Annotation set by the injector on every pod that received a sidecar
pub const SIDECAR_STATUS_ANNOTATION: &str = "sidecar.istio.io/status";

/// Warning for pods that cannot be traced back to a restartable owner
pub const OWNER_NOT_FOUND_MESSAGE: &str =
    "pod sidecar could not be updated because OwnerReferences was not found.";

/// Warning for pods owned by a Job, which cannot be rolled out
pub const OWNED_BY_JOB_MESSAGE: &str =
    "pod sidecar could not be updated because it is owned by a Job.";

// =============================================================================
// Workload references
// =============================================================================

/// Kind of object a restart acts on
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkloadKind {
    /// apps/v1 Deployment
    Deployment,
    /// apps/v1 DaemonSet
    DaemonSet,
    /// apps/v1 StatefulSet
    StatefulSet,
    /// apps/v1 ReplicaSet
    ReplicaSet,
    /// v1 ReplicationController
    ReplicationController,
    /// v1 Job owned pods, never restarted
    Job,
    /// A bare pod
    Pod,
    /// Any other owner kind
    Other,
}

impl WorkloadKind {
    /// Map an owner reference kind to a workload kind
    pub fn from_owner_kind(kind: &str) -> Self {
        match kind {
            "Deployment" => Self::Deployment,
            "DaemonSet" => Self::DaemonSet,
            "StatefulSet" => Self::StatefulSet,
            "ReplicaSet" => Self::ReplicaSet,
            "ReplicationController" => Self::ReplicationController,
            "Job" => Self::Job,
            "Pod" => Self::Pod,
            _ => Self::Other,
        }
    }

    /// Kubernetes kind name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deployment => "Deployment",
            Self::DaemonSet => "DaemonSet",
            Self::StatefulSet => "StatefulSet",
            Self::ReplicaSet => "ReplicaSet",
            Self::ReplicationController => "ReplicationController",
            Self::Job => "Job",
            Self::Pod => "Pod",
            Self::Other => "Other",
        }
    }
}

/// A namespaced object a restart acts on
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct WorkloadRef {
    /// Object kind
    pub kind: WorkloadKind,
    /// Namespace
    pub namespace: String,
    /// Name
    pub name: String,
}

impl WorkloadRef {
    /// Build a reference
    pub fn new(kind: WorkloadKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Reference to the pod itself
    pub fn for_pod(pod: &Pod) -> Self {
        Self::new(WorkloadKind::Pod, pod_namespace(pod), pod_name(pod))
    }
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// =============================================================================
// Pod helpers
// =============================================================================

/// Pod name, empty if unset
pub fn pod_name(pod: &Pod) -> &str {
    pod.metadata.name.as_deref().unwrap_or_default()
}

/// Pod namespace, empty if unset
pub fn pod_namespace(pod: &Pod) -> &str {
    pod.metadata.namespace.as_deref().unwrap_or_default()
}

/// Pod annotation value, if set
pub fn annotation<'a>(pod: &'a Pod, key: &str) -> Option<&'a str> {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

/// Pods deployed by customers: outside `istio-system` and not labelled as managed
pub fn is_customer_workload(pod: &Pod) -> bool {
    let managed = pod
        .metadata
        .labels
        .as_ref()
        .is_some_and(|l| l.contains_key(MANAGED_BY_LABEL_KEY));
    pod_namespace(pod) != ISTIO_SYSTEM_NAMESPACE && !managed
}

/// Pods owned by the platform, the complement of [`is_customer_workload`]
pub fn is_platform_workload(pod: &Pod) -> bool {
    !is_customer_workload(pod)
}

/// Running, not being deleted, and with every condition `True`
pub fn is_pod_ready(pod: &Pod) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return false;
    }
    let Some(status) = &pod.status else {
        return false;
    };
    let running = status.phase.as_deref() == Some("Running");
    let conditions_true = status
        .conditions
        .iter()
        .flatten()
        .all(|c| c.status == "True");
    running && conditions_true
}

/// Whether the injector added a sidecar to this pod
pub fn has_sidecar_status(pod: &Pod) -> bool {
    annotation(pod, SIDECAR_STATUS_ANNOTATION).is_some()
}

/// Every `istio-proxy` container, regular or init
pub fn proxy_containers(pod: &Pod) -> impl Iterator<Item = &Container> {
    pod.spec
        .iter()
        .flat_map(|spec| spec.containers.iter().chain(spec.init_containers.iter().flatten()))
        .filter(|c| c.name == ISTIO_PROXY_CONTAINER)
}

/// Whether the proxy runs as a native sidecar (an init container)
pub fn has_native_sidecar(pod: &Pod) -> bool {
    pod.spec
        .iter()
        .flat_map(|spec| spec.init_containers.iter().flatten())
        .any(|c| c.name == ISTIO_PROXY_CONTAINER)
}

// =============================================================================
// Control plane version
// =============================================================================

/// Containers whose image tag is the installed Istio version
const VERSIONED_CONTAINERS: [&str; 3] = ["discovery", ISTIO_PROXY_CONTAINER, "install-cni"];

/// Tag of a container image, ignoring any digest
pub fn image_tag(image: &str) -> Option<&str> {
    let image = image.split('@').next().unwrap_or(image);
    let (_, tag) = image.rsplit_once(':')?;
    (!tag.is_empty() && !tag.contains('/')).then_some(tag)
}

/// The one Istio version the system namespace pods run
///
/// Pods being deleted are ignored. Differing versions, or no versioned
/// container at all, are errors.
pub fn control_plane_version(pods: &[Pod]) -> Result<IstioVersion, Error> {
    let mut found: Option<IstioVersion> = None;
    for pod in pods.iter().filter(|p| p.metadata.deletion_timestamp.is_none()) {
        let tags = pod
            .spec
            .iter()
            .flat_map(|spec| spec.containers.iter())
            .filter(|c| VERSIONED_CONTAINERS.contains(&c.name.as_str()))
            .filter_map(|c| c.image.as_deref().and_then(image_tag));
        for tag in tags {
            let version = IstioVersion::parse(tag)?;
            match found {
                Some(other) if other != version => {
                    return Err(Error::restart(
                        ISTIO_SYSTEM_NAMESPACE,
                        format!(
                            "image version of Pod {} {} do not match other Pods version {}",
                            pod_name(pod),
                            version,
                            other
                        ),
                    ))
                }
                _ => found = Some(version),
            }
        }
    }
    found.ok_or_else(|| {
        Error::restart(
            ISTIO_SYSTEM_NAMESPACE,
            "unable to obtain installed Istio image version",
        )
    })
}

// =============================================================================
// Restart targets
// =============================================================================

/// What to do to get a pod recreated with a fresh sidecar
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RestartAction {
    /// Patch the pod template of the owning workload
    Rollout(WorkloadRef),
    /// Delete the pod so its controller recreates it
    DeletePod(WorkloadRef),
    /// Report that the pod cannot be restarted
    Warn {
        /// The pod concerned
        workload: WorkloadRef,
        /// Reason
        message: &'static str,
    },
    /// A rollout of the owner is already in progress
    Skip(WorkloadRef),
}

impl RestartAction {
    /// The object this action is keyed on, used to act once per owner
    pub fn target(&self) -> &WorkloadRef {
        match self {
            Self::Rollout(w) | Self::DeletePod(w) | Self::Skip(w) => w,
            Self::Warn { workload, .. } => workload,
        }
    }
}

/// The pod's first owner reference
pub fn pod_owner(pod: &Pod) -> Option<&OwnerReference> {
    pod.metadata.owner_references.as_ref().and_then(|o| o.first())
}

/// Resolve the action for a pod whose owner is not a ReplicaSet
///
/// Returns `None` when the owner is a ReplicaSet, which needs a lookup and is
/// resolved by [`resolve_replica_set_action`].
pub fn resolve_direct_action(pod: &Pod) -> Option<RestartAction> {
    let namespace = pod_namespace(pod);
    let Some(owner) = pod_owner(pod) else {
        return Some(RestartAction::Warn {
            workload: WorkloadRef::for_pod(pod),
            message: OWNER_NOT_FOUND_MESSAGE,
        });
    };

    match WorkloadKind::from_owner_kind(&owner.kind) {
        WorkloadKind::ReplicaSet => None,
        WorkloadKind::Job => Some(RestartAction::Warn {
            workload: WorkloadRef::for_pod(pod),
            message: OWNED_BY_JOB_MESSAGE,
        }),
        WorkloadKind::ReplicationController => {
            Some(RestartAction::DeletePod(WorkloadRef::for_pod(pod)))
        }
        kind => Some(RestartAction::Rollout(WorkloadRef::new(
            kind,
            namespace,
            owner.name.as_str(),
        ))),
    }
}

/// Resolve the action for a pod owned by `replica_set`
///
/// `siblings` are the ReplicaSets in the same namespace. A missing ReplicaSet
/// (`None`) means the owner is gone.
pub fn resolve_replica_set_action(
    pod: &Pod,
    replica_set: Option<&ReplicaSet>,
    siblings: &[ReplicaSet],
) -> RestartAction {
    let Some(replica_set) = replica_set else {
        return RestartAction::Warn {
            workload: WorkloadRef::for_pod(pod),
            message: OWNER_NOT_FOUND_MESSAGE,
        };
    };
    let Some(parent) = replica_set
        .metadata
        .owner_references
        .as_ref()
        .and_then(|o| o.first())
    else {
        return RestartAction::DeletePod(WorkloadRef::for_pod(pod));
    };

    let parent_ref = WorkloadRef::new(
        WorkloadKind::from_owner_kind(&parent.kind),
        pod_namespace(pod),
        parent.name.as_str(),
    );

    let rollout_in_progress = siblings.iter().any(|rs| {
        let same_parent = rs
            .metadata
            .owner_references
            .as_ref()
            .and_then(|o| o.first())
            .is_some_and(|o| o.uid == parent.uid);
        let replicas = rs.status.as_ref().map(|s| s.replicas).unwrap_or(0);
        let ready = rs
            .status
            .as_ref()
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0);
        same_parent
            && rs.metadata.name != replica_set.metadata.name
            && replicas != 0
            && ready != replicas
    });

    if rollout_in_progress {
        RestartAction::Skip(parent_ref)
    } else {
        RestartAction::Rollout(parent_ref)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::ReplicaSetStatus;
    use k8s_openapi::api::core::v1::{PodCondition, PodSpec, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use std::collections::BTreeMap;

    /// Builder for test pods
    #[derive(Default)]
    pub(crate) struct PodBuilder {
        name: String,
        namespace: String,
        labels: BTreeMap<String, String>,
        annotations: BTreeMap<String, String>,
        containers: Vec<Container>,
        init_containers: Vec<Container>,
        owner: Option<(String, String)>,
        phase: String,
        conditions: Vec<&'static str>,
        deleting: bool,
        created: Option<chrono::DateTime<chrono::Utc>>,
    }

    impl PodBuilder {
        pub(crate) fn new(namespace: &str, name: &str) -> Self {
            Self {
                name: name.into(),
                namespace: namespace.into(),
                phase: "Running".into(),
                conditions: vec!["True"],
                ..Default::default()
            }
        }

        pub(crate) fn label(mut self, key: &str, value: &str) -> Self {
            self.labels.insert(key.into(), value.into());
            self
        }

        pub(crate) fn annotation(mut self, key: &str, value: &str) -> Self {
            self.annotations.insert(key.into(), value.into());
            self
        }

        pub(crate) fn container(mut self, container: Container) -> Self {
            self.containers.push(container);
            self
        }

        pub(crate) fn init_container(mut self, container: Container) -> Self {
            self.init_containers.push(container);
            self
        }

        pub(crate) fn owner(mut self, kind: &str, name: &str) -> Self {
            self.owner = Some((kind.into(), name.into()));
            self
        }

        pub(crate) fn phase(mut self, phase: &str) -> Self {
            self.phase = phase.into();
            self
        }

        pub(crate) fn condition(mut self, status: &'static str) -> Self {
            self.conditions.push(status);
            self
        }

        pub(crate) fn deleting(mut self) -> Self {
            self.deleting = true;
            self
        }

        pub(crate) fn created(mut self, at: chrono::DateTime<chrono::Utc>) -> Self {
            self.created = Some(at);
            self
        }

        pub(crate) fn build(self) -> Pod {
            Pod {
                metadata: ObjectMeta {
                    name: Some(self.name),
                    namespace: Some(self.namespace),
                    labels: Some(self.labels),
                    annotations: Some(self.annotations),
                    owner_references: self.owner.map(|(kind, name)| {
                        vec![OwnerReference {
                            kind,
                            name,
                            api_version: "apps/v1".into(),
                            uid: "owner-uid".into(),
                            ..Default::default()
                        }]
                    }),
                    deletion_timestamp: self.deleting.then(|| Time(chrono::Utc::now())),
                    creation_timestamp: self.created.map(Time),
                    ..Default::default()
                },
                spec: Some(PodSpec {
                    containers: self.containers,
                    init_containers: Some(self.init_containers),
                    ..Default::default()
                }),
                status: Some(PodStatus {
                    phase: Some(self.phase),
                    conditions: Some(
                        self.conditions
                            .into_iter()
                            .map(|s| PodCondition {
                                status: s.into(),
                                type_: "Ready".into(),
                                ..Default::default()
                            })
                            .collect(),
                    ),
                    ..Default::default()
                }),
            }
        }
    }

    pub(crate) fn proxy(image: &str) -> Container {
        Container {
            name: ISTIO_PROXY_CONTAINER.into(),
            image: Some(image.into()),
            ..Default::default()
        }
    }

    fn replica_set(name: &str, parent_uid: Option<&str>, replicas: i32, ready: i32) -> ReplicaSet {
        ReplicaSet {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("shop".into()),
                owner_references: parent_uid.map(|uid| {
                    vec![OwnerReference {
                        kind: "Deployment".into(),
                        name: "checkout".into(),
                        api_version: "apps/v1".into(),
                        uid: uid.into(),
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            },
            status: Some(ReplicaSetStatus {
                replicas,
                ready_replicas: Some(ready),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    // ==========================================================================
    // Control plane version
    // ==========================================================================

    fn system_pod(name: &str, container: &str, image: &str) -> PodBuilder {
        PodBuilder::new(ISTIO_SYSTEM_NAMESPACE, name).container(Container {
            name: container.into(),
            image: Some(image.into()),
            ..Default::default()
        })
    }

    #[test]
    fn image_tags() {
        assert_eq!(image_tag("docker.io/istio/pilot:1.24.2"), Some("1.24.2"));
        assert_eq!(image_tag("localhost:5000/istio/pilot:1.24.2-distroless"), Some("1.24.2-distroless"));
        assert_eq!(image_tag("istio/pilot:1.24.2@sha256:abc"), Some("1.24.2"));
        assert_eq!(image_tag("localhost:5000/istio/pilot"), None);
        assert_eq!(image_tag("pilot"), None);
    }

    /// Story: istiod, the CNI node agent and a gateway all run 1.24.2, so
    /// that is the installed version.
    #[test]
    fn matching_system_pods_give_one_version() {
        let pods = vec![
            system_pod("istiod-x", "discovery", "hub/pilot:1.24.2").build(),
            system_pod("istio-cni-node-y", "install-cni", "hub/install-cni:1.24.2-distroless").build(),
            system_pod("istio-ingressgateway-z", ISTIO_PROXY_CONTAINER, "hub/proxyv2:1.24.2").build(),
            system_pod("metrics", "exporter", "hub/exporter:0.1.0").build(),
        ];
        assert_eq!(
            control_plane_version(&pods).unwrap(),
            IstioVersion::parse("1.24.2").unwrap()
        );
    }

    /// Story: an old istiod pod is still terminating next to the upgraded
    /// one. Only the live pods count.
    #[test]
    fn terminating_system_pods_are_ignored() {
        let pods = vec![
            system_pod("istiod-old", "discovery", "hub/pilot:1.23.4").deleting().build(),
            system_pod("istiod-new", "discovery", "hub/pilot:1.24.2").build(),
        ];
        assert_eq!(control_plane_version(&pods).unwrap().to_string(), "1.24.2");
    }

    #[test]
    fn mixed_system_versions_are_rejected() {
        let pods = vec![
            system_pod("istiod-x", "discovery", "hub/pilot:1.24.2").build(),
            system_pod("istio-cni-node-y", "install-cni", "hub/install-cni:1.23.4").build(),
        ];
        let err = control_plane_version(&pods).unwrap_err();
        assert!(err
            .to_string()
            .contains("image version of Pod istio-cni-node-y 1.23.4 do not match other Pods version 1.24.2"));
    }

    #[test]
    fn no_versioned_container_is_rejected() {
        let pods = vec![system_pod("metrics", "exporter", "hub/exporter:0.1.0").build()];
        let err = control_plane_version(&pods).unwrap_err();
        assert!(err.to_string().contains("unable to obtain installed Istio image version"));
    }

    // ==========================================================================
    // Scope and readiness
    // ==========================================================================

    #[test]
    fn customer_scope_excludes_system_and_managed() {
        let customer = PodBuilder::new("shop", "a").build();
        let system = PodBuilder::new(ISTIO_SYSTEM_NAMESPACE, "b").build();
        let managed = PodBuilder::new("shop", "c")
            .label(MANAGED_BY_LABEL_KEY, "meshkeeper")
            .build();

        assert!(is_customer_workload(&customer));
        assert!(!is_customer_workload(&system));
        assert!(!is_customer_workload(&managed));
        assert!(is_platform_workload(&system));
        assert!(is_platform_workload(&managed));
    }

    #[test]
    fn readiness_requires_running_true_and_not_deleting() {
        assert!(is_pod_ready(&PodBuilder::new("ns", "ok").build()));
        assert!(!is_pod_ready(&PodBuilder::new("ns", "p").phase("Pending").build()));
        assert!(!is_pod_ready(&PodBuilder::new("ns", "f").condition("False").build()));
        assert!(!is_pod_ready(&PodBuilder::new("ns", "d").deleting().build()));
    }

    #[test]
    fn proxy_containers_include_init_containers() {
        let pod = PodBuilder::new("ns", "p")
            .container(Container {
                name: "app".into(),
                ..Default::default()
            })
            .init_container(proxy("hub/proxyv2:1.24.2"))
            .build();
        assert_eq!(proxy_containers(&pod).count(), 1);
        assert!(has_native_sidecar(&pod));

        let classic = PodBuilder::new("ns", "q").container(proxy("x")).build();
        assert!(!has_native_sidecar(&classic));
        assert_eq!(proxy_containers(&classic).count(), 1);
    }

    // ==========================================================================
    // Restart targets
    // ==========================================================================

    #[test]
    fn pod_without_owner_warns() {
        let pod = PodBuilder::new("shop", "bare").build();
        assert_eq!(
            resolve_direct_action(&pod),
            Some(RestartAction::Warn {
                workload: WorkloadRef::for_pod(&pod),
                message: OWNER_NOT_FOUND_MESSAGE,
            })
        );
    }

    #[test]
    fn job_pod_warns() {
        let pod = PodBuilder::new("shop", "migrate-x").owner("Job", "migrate").build();
        assert!(matches!(
            resolve_direct_action(&pod),
            Some(RestartAction::Warn { message: OWNED_BY_JOB_MESSAGE, .. })
        ));
    }

    #[test]
    fn daemon_set_pod_rolls_out_owner() {
        let pod = PodBuilder::new("logging", "agent-x")
            .owner("DaemonSet", "agent")
            .build();
        assert_eq!(
            resolve_direct_action(&pod),
            Some(RestartAction::Rollout(WorkloadRef::new(
                WorkloadKind::DaemonSet,
                "logging",
                "agent"
            )))
        );
    }

    #[test]
    fn replication_controller_pod_is_deleted() {
        let pod = PodBuilder::new("legacy", "rc-x")
            .owner("ReplicationController", "rc")
            .build();
        assert!(matches!(
            resolve_direct_action(&pod),
            Some(RestartAction::DeletePod(_))
        ));
    }

    #[test]
    fn replica_set_pod_needs_lookup() {
        let pod = PodBuilder::new("shop", "checkout-abc")
            .owner("ReplicaSet", "checkout-abc")
            .build();
        assert_eq!(resolve_direct_action(&pod), None);
    }

    #[test]
    fn replica_set_owned_by_deployment_rolls_out_deployment() {
        let pod = PodBuilder::new("shop", "checkout-abc-1")
            .owner("ReplicaSet", "checkout-abc")
            .build();
        let rs = replica_set("checkout-abc", Some("dep-uid"), 2, 2);
        let action = resolve_replica_set_action(&pod, Some(&rs), std::slice::from_ref(&rs));
        assert_eq!(
            action,
            RestartAction::Rollout(WorkloadRef::new(WorkloadKind::Deployment, "shop", "checkout"))
        );
    }

    #[test]
    fn rollout_in_progress_is_skipped() {
        let pod = PodBuilder::new("shop", "checkout-abc-1")
            .owner("ReplicaSet", "checkout-abc")
            .build();
        let current = replica_set("checkout-abc", Some("dep-uid"), 2, 2);
        let rolling = replica_set("checkout-def", Some("dep-uid"), 1, 0);
        let action = resolve_replica_set_action(&pod, Some(&current), &[current.clone(), rolling]);
        assert!(matches!(action, RestartAction::Skip(_)));
    }

    #[test]
    fn scaled_down_sibling_does_not_block() {
        let pod = PodBuilder::new("shop", "checkout-abc-1")
            .owner("ReplicaSet", "checkout-abc")
            .build();
        let current = replica_set("checkout-abc", Some("dep-uid"), 2, 2);
        let old = replica_set("checkout-old", Some("dep-uid"), 0, 0);
        let other = replica_set("other-rs", Some("other-uid"), 3, 1);
        let action = resolve_replica_set_action(&pod, Some(&current), &[current.clone(), old, other]);
        assert!(matches!(action, RestartAction::Rollout(_)));
    }

    #[test]
    fn orphan_replica_set_deletes_pod() {
        let pod = PodBuilder::new("shop", "rs-1").owner("ReplicaSet", "rs").build();
        let rs = replica_set("rs", None, 1, 1);
        assert!(matches!(
            resolve_replica_set_action(&pod, Some(&rs), &[]),
            RestartAction::DeletePod(_)
        ));
    }

    #[test]
    fn missing_replica_set_warns() {
        let pod = PodBuilder::new("shop", "rs-1").owner("ReplicaSet", "rs").build();
        assert!(matches!(
            resolve_replica_set_action(&pod, None, &[]),
            RestartAction::Warn { message: OWNER_NOT_FOUND_MESSAGE, .. }
        ));
    }
}
