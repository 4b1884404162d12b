//! MeshInstallation CRD: the user's desired configuration for the mesh
//!
//! Every overridable scalar is an `Option`. `None` means "leave the current
//! setting untouched" and is never serialized, `Some(v)` means "set exactly v".
//! This distinction must survive the round trip through the
//! last-applied-configuration annotation.

use std::collections::{BTreeMap, HashSet};

use k8s_openapi::api::core::v1::Affinity;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::status::MeshInstallationStatus;
use crate::quantity::{validate_cpu_quantity, validate_memory_quantity};
use crate::Error;

/// Desired configuration of the managed Istio installation
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "meshkeeper.dev",
    version = "v1alpha1",
    kind = "MeshInstallation",
    plural = "meshinstallations",
    shortname = "mi",
    namespaced,
    status = "MeshInstallationStatus",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DesiredConfiguration {
    /// Mesh wide configuration
    #[serde(default)]
    pub config: MeshConfig,

    /// Per-component Kubernetes overrides
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub components: Option<Components>,

    /// Experimental features
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experimental: Option<Experimental>,

    /// Keep the behaviour of the previous minor Istio version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compatibility_mode: Option<bool>,
}

impl DesiredConfiguration {
    /// Effective compatibility mode (absent means disabled)
    pub fn is_compatibility_mode(&self) -> bool {
        self.compatibility_mode.unwrap_or(false)
    }

    /// Effective Prometheus merge flag (absent means disabled)
    pub fn prometheus_merge(&self) -> bool {
        self.config
            .telemetry
            .as_ref()
            .and_then(|t| t.metrics.as_ref())
            .and_then(|m| m.prometheus_merge)
            .unwrap_or(false)
    }

    /// Validate fields whose errors are fatal for the reconcile
    ///
    /// Duplicate authorizer names are checked separately by
    /// [`DesiredConfiguration::validate_authorizers`] since they only block the
    /// authorizer feature.
    pub fn validate(&self) -> Result<(), Error> {
        if let Some(policy) = &self.config.gateway_external_traffic_policy {
            if policy != "Local" && policy != "Cluster" {
                return Err(Error::validation_for_field(
                    "config.gatewayExternalTrafficPolicy",
                    format!("'{policy}' is not supported, must be Local or Cluster"),
                ));
            }
        }

        if let Some(components) = &self.components {
            for (name, resources) in components.resource_overrides() {
                resources.validate(name)?;
            }
            for (name, k8s) in components.scaling_overrides() {
                k8s.validate_scaling(name)?;
            }
        }
        Ok(())
    }

    /// Reject authorizers sharing a name
    pub fn validate_authorizers(&self) -> Result<(), Error> {
        let mut seen = HashSet::new();
        for authorizer in &self.config.authorizers {
            if !seen.insert(authorizer.name.as_str()) {
                return Err(Error::validation_for_field(
                    "config.authorizers",
                    format!("authorizer name '{}' is used more than once", authorizer.name),
                ));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Mesh configuration
// =============================================================================

/// Mesh wide configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MeshConfig {
    /// Number of trusted proxies in front of the ingress gateway
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_trusted_proxies: Option<u32>,

    /// How the X-Forwarded-Client-Cert header is handled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward_client_cert_details: Option<XfccStrategy>,

    /// External authorization providers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authorizers: Vec<Authorizer>,

    /// `Local` or `Cluster`; applied to the ingress gateway Service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_external_traffic_policy: Option<String>,

    /// SPIFFE trust domain of the mesh
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust_domain: Option<String>,

    /// Capture DNS queries in the sidecar
    #[serde(
        default,
        rename = "enableDNSProxying",
        skip_serializing_if = "Option::is_none"
    )]
    pub enable_dns_proxying: Option<bool>,

    /// Telemetry settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telemetry: Option<Telemetry>,
}

/// X-Forwarded-Client-Cert handling strategy
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum XfccStrategy {
    /// Do not send the header to the next hop
    Sanitize,
    /// Forward only when the client connection is mTLS
    ForwardOnly,
    /// Append client certificate details when mTLS, forward otherwise
    AppendForward,
    /// Reset the header with client certificate details when mTLS
    SanitizeSet,
    /// Always forward the header, regardless of mTLS
    AlwaysForwardOnly,
}

impl XfccStrategy {
    /// Wire representation used in mesh configuration
    pub fn as_str(&self) -> &'static str {
        match self {
            XfccStrategy::Sanitize => "SANITIZE",
            XfccStrategy::ForwardOnly => "FORWARD_ONLY",
            XfccStrategy::AppendForward => "APPEND_FORWARD",
            XfccStrategy::SanitizeSet => "SANITIZE_SET",
            XfccStrategy::AlwaysForwardOnly => "ALWAYS_FORWARD_ONLY",
        }
    }
}

/// External authorization provider
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Authorizer {
    /// Unique provider name, referenced by AuthorizationPolicies
    pub name: String,
    /// Service host of the authorizer
    pub service: String,
    /// Service port of the authorizer
    pub port: u32,
    /// Header forwarding rules
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<AuthorizerHeaders>,
    /// Prefix added to the authorization request path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_prefix: Option<String>,
    /// Timeout of the authorization request (e.g. "5s")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

/// Header rules of an authorizer
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizerHeaders {
    /// Headers sent to the authorizer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_check: Option<InCheckHeaders>,
    /// Headers forwarded upstream on allow
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_upstream: Option<UpstreamHeaders>,
    /// Headers returned downstream
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_downstream: Option<DownstreamHeaders>,
}

/// Headers included in the authorization check
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InCheckHeaders {
    /// Client request headers to include
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include: Option<Vec<String>>,
    /// Additional fixed headers to add
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add: Option<BTreeMap<String, String>>,
}

/// Authorizer response headers sent to the upstream
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamHeaders {
    /// Forwarded when the request is allowed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_allow: Option<Vec<String>>,
}

/// Authorizer response headers sent back to the client
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DownstreamHeaders {
    /// Returned when the request is allowed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_allow: Option<Vec<String>>,
    /// Returned when the request is denied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_deny: Option<Vec<String>>,
}

/// Telemetry settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Telemetry {
    /// Metrics settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Metrics>,
}

/// Metrics settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    /// Merge application and sidecar metrics on the sidecar status port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prometheus_merge: Option<bool>,
}

// =============================================================================
// Components
// =============================================================================

/// Per-component Kubernetes overrides
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Components {
    /// Control plane (istiod)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pilot: Option<IstioComponent>,
    /// Ingress gateway
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_gateway: Option<IstioComponent>,
    /// Egress gateway
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub egress_gateway: Option<EgressGateway>,
    /// CNI node agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cni: Option<CniComponent>,
    /// Sidecar proxy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyComponent>,
}

impl Components {
    /// All resource overrides, labelled by component
    pub fn resource_overrides(&self) -> Vec<(&'static str, &Resources)> {
        let mut out = Vec::new();
        let deployments = [
            ("pilot", self.pilot.as_ref().and_then(|c| c.k8s.as_ref())),
            (
                "ingressGateway",
                self.ingress_gateway.as_ref().and_then(|c| c.k8s.as_ref()),
            ),
            (
                "egressGateway",
                self.egress_gateway.as_ref().and_then(|c| c.k8s.as_ref()),
            ),
        ];
        for (name, k8s) in deployments {
            if let Some(resources) = k8s.and_then(|k| k.resources.as_ref()) {
                out.push((name, resources));
            }
        }
        if let Some(resources) = self
            .cni
            .as_ref()
            .and_then(|c| c.k8s.as_ref())
            .and_then(|k| k.resources.as_ref())
        {
            out.push(("cni", resources));
        }
        if let Some(resources) = self
            .proxy
            .as_ref()
            .and_then(|c| c.k8s.as_ref())
            .and_then(|k| k.resources.as_ref())
        {
            out.push(("proxy", resources));
        }
        out
    }

    fn scaling_overrides(&self) -> Vec<(&'static str, &KubernetesResources)> {
        [
            ("pilot", self.pilot.as_ref().and_then(|c| c.k8s.as_ref())),
            (
                "ingressGateway",
                self.ingress_gateway.as_ref().and_then(|c| c.k8s.as_ref()),
            ),
            (
                "egressGateway",
                self.egress_gateway.as_ref().and_then(|c| c.k8s.as_ref()),
            ),
        ]
        .into_iter()
        .filter_map(|(name, k8s)| k8s.map(|k| (name, k)))
        .collect()
    }
}

/// A Deployment based component
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IstioComponent {
    /// Kubernetes overrides
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k8s: Option<KubernetesResources>,
}

/// The egress gateway, which is disabled unless requested
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EgressGateway {
    /// Kubernetes overrides
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k8s: Option<KubernetesResources>,
    /// Whether the egress gateway is deployed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

/// The CNI DaemonSet
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CniComponent {
    /// Kubernetes overrides
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k8s: Option<CniKubernetesResources>,
}

/// Kubernetes overrides of the CNI DaemonSet
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CniKubernetesResources {
    /// Scheduling affinity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,
    /// Container resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Resources>,
}

/// The sidecar proxy
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProxyComponent {
    /// Kubernetes overrides
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k8s: Option<ProxyKubernetesResources>,
}

/// Kubernetes overrides of the sidecar proxy
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProxyKubernetesResources {
    /// Container resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Resources>,
}

/// Kubernetes overrides of a Deployment based component
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesResources {
    /// Horizontal pod autoscaler bounds
    #[serde(default, rename = "hpaSpec", skip_serializing_if = "Option::is_none")]
    pub hpa_spec: Option<HpaSpec>,
    /// Deployment rollout strategy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Strategy>,
    /// Container resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Resources>,
}

impl KubernetesResources {
    fn validate_scaling(&self, component: &str) -> Result<(), Error> {
        let Some(hpa) = &self.hpa_spec else {
            return Ok(());
        };
        if let Some(min) = hpa.min_replicas {
            if min < 0 {
                return Err(Error::validation_for_field(
                    format!("components.{component}.k8s.hpaSpec.minReplicas"),
                    "must not be negative",
                ));
            }
        }
        if let (Some(min), Some(max)) = (hpa.min_replicas, hpa.max_replicas) {
            if min > max {
                return Err(Error::validation_for_field(
                    format!("components.{component}.k8s.hpaSpec"),
                    format!("minReplicas ({min}) must not exceed maxReplicas ({max})"),
                ));
            }
        }
        Ok(())
    }
}

/// Horizontal pod autoscaler bounds
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HpaSpec {
    /// Upper replica bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_replicas: Option<i32>,
    /// Lower replica bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<i32>,
}

/// Deployment rollout strategy
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Strategy {
    /// Rolling update parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolling_update: Option<RollingUpdate>,
}

/// Rolling update parameters
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RollingUpdate {
    /// Pods created above the desired count during a rollout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_surge: Option<IntOrString>,
    /// Pods that may be unavailable during a rollout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<IntOrString>,
}

/// CPU and memory requests and limits
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Resources {
    /// Upper bounds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceClaims>,
    /// Guaranteed amounts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceClaims>,
}

impl Resources {
    /// Validate every quantity string
    pub fn validate(&self, component: &str) -> Result<(), Error> {
        for (kind, claims) in [("limits", &self.limits), ("requests", &self.requests)] {
            let Some(claims) = claims else { continue };
            if let Some(cpu) = &claims.cpu {
                validate_cpu_quantity(cpu, &format!("components.{component}.{kind}.cpu"))?;
            }
            if let Some(memory) = &claims.memory {
                validate_memory_quantity(
                    memory,
                    &format!("components.{component}.{kind}.memory"),
                )?;
            }
        }
        Ok(())
    }
}

/// A CPU/memory pair
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceClaims {
    /// CPU quantity (e.g. "100m")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    /// Memory quantity (e.g. "128Mi")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

// =============================================================================
// Experimental
// =============================================================================

/// Experimental features
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Experimental {
    /// Control plane features
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pilot: Option<ExperimentalPilot>,
    /// Enable IPv4/IPv6 dual stack
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_dual_stack: Option<bool>,
}

/// Experimental control plane features
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentalPilot {
    /// Serve alpha Gateway API resources
    #[serde(
        default,
        rename = "enableAlphaGatewayAPI",
        skip_serializing_if = "Option::is_none"
    )]
    pub enable_alpha_gateway_api: Option<bool>,
    /// Discover gateways across networks through the Gateway API
    #[serde(
        default,
        rename = "enableMultiNetworkDiscoverGatewayAPI",
        skip_serializing_if = "Option::is_none"
    )]
    pub enable_multi_network_discover_gateway_api: Option<bool>,
}
