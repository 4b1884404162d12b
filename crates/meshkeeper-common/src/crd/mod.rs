//! Custom Resource Definitions for meshkeeper

mod mesh_installation;
mod status;

pub use mesh_installation::{
    Authorizer, AuthorizerHeaders, CniComponent, CniKubernetesResources, Components,
    DesiredConfiguration, DownstreamHeaders, EgressGateway, Experimental, ExperimentalPilot,
    HpaSpec, InCheckHeaders, IstioComponent, KubernetesResources, MeshConfig, MeshInstallation,
    Metrics, ProxyComponent, ProxyKubernetesResources, ResourceClaims, Resources, RollingUpdate,
    Strategy, Telemetry, UpstreamHeaders, XfccStrategy,
};
pub use status::{
    Condition, ConditionReason, ConditionStatus, ConditionType, MeshInstallationStatus,
    ReasonWithMessage, State,
};
