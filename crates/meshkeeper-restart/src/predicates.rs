//! Restart predicates
//!
//! Predicates are pure: they compare the previously applied configuration with
//! the desired one and, for sidecar predicates, inspect a single pod. Their
//! results are combined by [`crate::evaluator`].

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, Pod};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity as K8sQuantity;

use meshkeeper_common::crd::{DesiredConfiguration, MeshConfig, Resources};
use meshkeeper_common::quantity::parse_quantity;
use meshkeeper_common::DEFAULT_PROXY_STATUS_PORT;
use meshkeeper_config::CompatibilityTables;

use crate::workload::{
    annotation, has_native_sidecar, is_customer_workload, is_platform_workload, proxy_containers,
};

/// Pods with a custom proxy image are never restarted for image drift
pub const PROXY_IMAGE_ANNOTATION: &str = "sidecar.istio.io/proxyImage";

/// Per-pod override of native sidecar injection
pub const NATIVE_SIDECAR_ANNOTATION: &str = "sidecar.istio.io/nativeSidecar";

/// Prometheus scrape path annotation
pub const PROMETHEUS_PATH_ANNOTATION: &str = "prometheus.io/path";

/// Prometheus scrape port annotation
pub const PROMETHEUS_PORT_ANNOTATION: &str = "prometheus.io/port";

/// Scrape path the sidecar serves merged metrics on
pub const PROMETHEUS_MERGE_PATH: &str = "/stats/prometheus";

const PROXY_CPU_REQUEST_ANNOTATION: &str = "sidecar.istio.io/proxyCPU";
const PROXY_MEMORY_REQUEST_ANNOTATION: &str = "sidecar.istio.io/proxyMemory";
const PROXY_CPU_LIMIT_ANNOTATION: &str = "sidecar.istio.io/proxyCPULimit";
const PROXY_MEMORY_LIMIT_ANNOTATION: &str = "sidecar.istio.io/proxyMemoryLimit";

/// A named boolean test over a subject
pub trait Predicate<S: ?Sized> {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// Whether the subject requires a restart
    fn matches(&self, subject: &S) -> bool;

    /// Gates that must hold in addition to the OR of the other predicates
    fn must_match(&self) -> bool {
        false
    }
}

/// True when exactly one side is present, or both are present and differ
pub fn option_changed<T: PartialEq>(previous: Option<&T>, desired: Option<&T>) -> bool {
    match (previous, desired) {
        (Some(a), Some(b)) => a != b,
        (None, None) => false,
        _ => true,
    }
}

// =============================================================================
// Configuration changes
// =============================================================================

/// Previous and desired mesh configuration
#[derive(Clone, Copy, Debug)]
pub struct ConfigDiff<'a> {
    /// Last applied
    pub previous: &'a MeshConfig,
    /// Requested
    pub desired: &'a MeshConfig,
}

/// Mesh settings whose change needs workloads restarted to take effect
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigChange {
    /// `numTrustedProxies`
    NumTrustedProxies,
    /// `forwardClientCertDetails`
    ForwardClientCertDetails,
    /// `trustDomain`
    TrustDomain,
    /// `enableDNSProxying`
    DnsProxying,
}

impl ConfigChange {
    /// Predicates deciding an ingress gateway restart
    pub const INGRESS_GATEWAY: &'static [ConfigChange] = &[
        ConfigChange::NumTrustedProxies,
        ConfigChange::ForwardClientCertDetails,
        ConfigChange::TrustDomain,
    ];

    /// Predicates deciding an egress gateway restart
    pub const EGRESS_GATEWAY: &'static [ConfigChange] = &[ConfigChange::NumTrustedProxies];
}

impl<'a> Predicate<ConfigDiff<'a>> for ConfigChange {
    fn name(&self) -> &'static str {
        match self {
            Self::NumTrustedProxies => "numTrustedProxies",
            Self::ForwardClientCertDetails => "forwardClientCertDetails",
            Self::TrustDomain => "trustDomain",
            Self::DnsProxying => "enableDNSProxying",
        }
    }

    fn matches(&self, diff: &ConfigDiff<'a>) -> bool {
        let (p, d) = (diff.previous, diff.desired);
        match self {
            Self::NumTrustedProxies => {
                option_changed(p.num_trusted_proxies.as_ref(), d.num_trusted_proxies.as_ref())
            }
            Self::ForwardClientCertDetails => option_changed(
                p.forward_client_cert_details.as_ref(),
                d.forward_client_cert_details.as_ref(),
            ),
            Self::TrustDomain => option_changed(p.trust_domain.as_ref(), d.trust_domain.as_ref()),
            Self::DnsProxying => {
                option_changed(p.enable_dns_proxying.as_ref(), d.enable_dns_proxying.as_ref())
            }
        }
    }
}

// =============================================================================
// Sidecar predicates
// =============================================================================

/// Per-pod restart predicate for injected workloads
#[derive(Clone, Debug, PartialEq)]
pub enum SidecarPredicate {
    /// A mesh setting changed; applies to every pod
    ConfigChanged {
        /// Which setting
        change: ConfigChange,
        /// Result of comparing previous and desired configuration
        changed: bool,
    },
    /// Compatibility mode was toggled and it injects proxy metadata
    CompatibilityMode {
        /// Previously applied flag
        previous: bool,
        /// Desired flag
        desired: bool,
        /// Whether the compatibility tables touch the proxies at all
        affects_proxies: bool,
    },
    /// Prometheus merge was toggled and the pod's scrape annotations disagree
    PrometheusMerge {
        /// Previously applied flag
        previous: bool,
        /// Desired flag
        desired: bool,
        /// Proxy status port serving merged metrics
        status_port: u16,
    },
    /// Native sidecar mode of the pod disagrees with what injection would produce
    NativeSidecar {
        /// Desired compatibility mode
        compatibility_mode: bool,
    },
    /// Proxy image or resources drifted from what injection would produce
    ImageResources {
        /// Expected `{hub}/proxyv2:{tag}`
        image: String,
        /// Expected proxy resources from the merged manifest
        resources: Resources,
    },
    /// Gate: only customer workloads
    CustomerWorkload,
    /// Gate: only platform workloads
    PlatformWorkload,
}

impl SidecarPredicate {
    /// The standard predicate set for a transition between two configurations
    pub fn for_transition(
        previous: &DesiredConfiguration,
        desired: &DesiredConfiguration,
        tables: &CompatibilityTables,
        image: impl Into<String>,
        resources: Resources,
    ) -> Vec<Self> {
        let diff = ConfigDiff {
            previous: &previous.config,
            desired: &desired.config,
        };
        vec![
            Self::CompatibilityMode {
                previous: previous.is_compatibility_mode(),
                desired: desired.is_compatibility_mode(),
                affects_proxies: tables.affects_proxies(),
            },
            Self::ImageResources {
                image: image.into(),
                resources,
            },
            Self::PrometheusMerge {
                previous: previous.prometheus_merge(),
                desired: desired.prometheus_merge(),
                status_port: DEFAULT_PROXY_STATUS_PORT,
            },
            Self::NativeSidecar {
                compatibility_mode: desired.is_compatibility_mode(),
            },
            Self::ConfigChanged {
                change: ConfigChange::DnsProxying,
                changed: ConfigChange::DnsProxying.matches(&diff),
            },
        ]
    }
}

impl Predicate<Pod> for SidecarPredicate {
    fn name(&self) -> &'static str {
        match self {
            Self::ConfigChanged { change, .. } => {
                <ConfigChange as Predicate<ConfigDiff<'_>>>::name(change)
            }
            Self::CompatibilityMode { .. } => "compatibilityMode",
            Self::PrometheusMerge { .. } => "prometheusMerge",
            Self::NativeSidecar { .. } => "nativeSidecar",
            Self::ImageResources { .. } => "imageResources",
            Self::CustomerWorkload => "customerWorkload",
            Self::PlatformWorkload => "platformWorkload",
        }
    }

    fn matches(&self, pod: &Pod) -> bool {
        match self {
            Self::ConfigChanged { changed, .. } => *changed,
            Self::CompatibilityMode {
                previous,
                desired,
                affects_proxies,
            } => *affects_proxies && previous != desired,
            Self::PrometheusMerge {
                previous,
                desired,
                status_port,
            } => prometheus_merge_requires_restart(pod, *previous, *desired, *status_port),
            Self::NativeSidecar { compatibility_mode } => {
                native_sidecar_requires_restart(pod, *compatibility_mode)
            }
            Self::ImageResources { image, resources } => {
                image_resources_require_restart(pod, image, resources)
            }
            Self::CustomerWorkload => is_customer_workload(pod),
            Self::PlatformWorkload => is_platform_workload(pod),
        }
    }

    fn must_match(&self) -> bool {
        matches!(self, Self::CustomerWorkload | Self::PlatformWorkload)
    }
}

fn prometheus_merge_requires_restart(
    pod: &Pod,
    previous: bool,
    desired: bool,
    status_port: u16,
) -> bool {
    if previous == desired {
        return false;
    }
    let has_path = annotation(pod, PROMETHEUS_PATH_ANNOTATION) == Some(PROMETHEUS_MERGE_PATH);
    let port = status_port.to_string();
    let has_port = annotation(pod, PROMETHEUS_PORT_ANNOTATION) == Some(port.as_str());
    if desired {
        !has_path || !has_port
    } else {
        has_path || has_port
    }
}

fn native_sidecar_requires_restart(pod: &Pod, compatibility_mode: bool) -> bool {
    let native = has_native_sidecar(pod);
    // A missing annotation behaves like an empty one
    match (native, annotation(pod, NATIVE_SIDECAR_ANNOTATION).unwrap_or("")) {
        (false, "") => !compatibility_mode,
        (false, "true") => true,
        (true, "") => compatibility_mode,
        (true, "false") => true,
        _ => false,
    }
}

fn image_resources_require_restart(pod: &Pod, image: &str, resources: &Resources) -> bool {
    if annotation(pod, PROXY_IMAGE_ANNOTATION).is_some() {
        return false;
    }
    let image_drift = proxy_containers(pod).any(|c| c.image.as_deref() != Some(image));
    image_drift || resources_drift(pod, resources)
}

/// CPU and memory requests and limits in nano-units, zero when unset
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct ProxyResources {
    cpu_request: u128,
    memory_request: u128,
    cpu_limit: u128,
    memory_limit: u128,
}

fn resources_drift(pod: &Pod, resources: &Resources) -> bool {
    // Invalid annotations are rejected by the injection webhook anyway
    let Some(expected) = expected_resources(pod, resources) else {
        return false;
    };
    proxy_containers(pod).any(|c| container_resources(c) != Some(expected))
}

fn expected_resources(pod: &Pod, resources: &Resources) -> Option<ProxyResources> {
    let requests = resources.requests.as_ref();
    let limits = resources.limits.as_ref();
    let value = |annotation_key: &str, configured: Option<&String>| -> Option<u128> {
        match annotation(pod, annotation_key) {
            Some(raw) => nanos(raw),
            None => configured.map_or(Some(0), |raw| nanos(raw)),
        }
    };
    Some(ProxyResources {
        cpu_request: value(
            PROXY_CPU_REQUEST_ANNOTATION,
            requests.and_then(|r| r.cpu.as_ref()),
        )?,
        memory_request: value(
            PROXY_MEMORY_REQUEST_ANNOTATION,
            requests.and_then(|r| r.memory.as_ref()),
        )?,
        cpu_limit: value(PROXY_CPU_LIMIT_ANNOTATION, limits.and_then(|l| l.cpu.as_ref()))?,
        memory_limit: value(
            PROXY_MEMORY_LIMIT_ANNOTATION,
            limits.and_then(|l| l.memory.as_ref()),
        )?,
    })
}

fn container_resources(container: &Container) -> Option<ProxyResources> {
    let resources = container.resources.as_ref();
    let requests = resources.and_then(|r| r.requests.as_ref());
    let limits = resources.and_then(|r| r.limits.as_ref());
    Some(ProxyResources {
        cpu_request: map_nanos(requests, "cpu")?,
        memory_request: map_nanos(requests, "memory")?,
        cpu_limit: map_nanos(limits, "cpu")?,
        memory_limit: map_nanos(limits, "memory")?,
    })
}

fn map_nanos(map: Option<&BTreeMap<String, K8sQuantity>>, key: &str) -> Option<u128> {
    match map.and_then(|m| m.get(key)) {
        Some(q) => nanos(&q.0),
        None => Some(0),
    }
}

fn nanos(raw: &str) -> Option<u128> {
    parse_quantity(raw).ok().map(|q| q.as_nanos())
}
