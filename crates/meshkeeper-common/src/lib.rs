//! Common types for meshkeeper: CRDs, errors, outcomes, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod outcome;
pub mod quantity;
pub mod telemetry;
pub mod yaml;

pub use error::Error;
pub use outcome::{most_severe, DescribedOutcome, Severity};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace where the mesh control plane and its gateways run
pub const ISTIO_SYSTEM_NAMESPACE: &str = "istio-system";

/// Label marking workloads owned by the platform rather than by customers
pub const MANAGED_BY_LABEL_KEY: &str = "meshkeeper.dev/managed-by";

/// Value of [`MANAGED_BY_LABEL_KEY`] on workloads deployed by meshkeeper itself
pub const MANAGED_BY_LABEL_VALUE: &str = "meshkeeper";

/// Annotation holding the last successfully applied configuration
pub const LAST_APPLIED_CONFIGURATION_ANNOTATION: &str =
    "meshkeeper.dev/last-applied-configuration";

/// Annotation patched onto pod templates to trigger a rolling restart
pub const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

/// Name of the sidecar proxy container injected into workloads
pub const ISTIO_PROXY_CONTAINER: &str = "istio-proxy";

/// Name of the ingress gateway Deployment and Service
pub const INGRESS_GATEWAY_NAME: &str = "istio-ingressgateway";

/// Name of the egress gateway Deployment
pub const EGRESS_GATEWAY_NAME: &str = "istio-egressgateway";

/// Port the sidecar serves merged Prometheus metrics on
pub const DEFAULT_PROXY_STATUS_PORT: u16 = 15020;

/// Field manager used for server-side apply patches
pub const FIELD_MANAGER: &str = "meshkeeper-controller";
