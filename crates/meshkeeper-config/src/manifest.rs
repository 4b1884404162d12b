//! Base manifest selection and writing the merged manifest
//!
//! The operator ships two IstioOperator base manifests, one per cluster size
//! tier. The cluster flavour contributes an override document that is merged
//! on top of the user's configuration. The result is written to the working
//! directory for the installer to pick up.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use k8s_openapi::api::core::v1::Node;
use regex::Regex;
use serde_json::{json, Value};
use tracing::{debug, info};

use meshkeeper_common::crd::{DesiredConfiguration, Resources};
use meshkeeper_common::quantity::parse_quantity;
use meshkeeper_common::yaml::{parse_manifest, to_yaml};
use meshkeeper_common::{Error, Result};

use crate::deep_merge::{get_path, object_at};
use crate::merger::StructuralMerger;

/// Base manifest for production sized clusters
pub const PRODUCTION_MANIFEST_FILE: &str = "istio-operator.yaml";

/// Base manifest for evaluation sized clusters
pub const EVALUATION_MANIFEST_FILE: &str = "istio-operator-light.yaml";

/// Annotation the Gardener DNS controller reads on the ingress gateway
pub const GARDENER_DNS_NAMES_ANNOTATION: &str = "dns.gardener.cloud/dnsnames";

/// Host served by k3d development clusters
const K3D_DNS_NAMES: &str = "'*.local.kyma.dev'";

/// File name of the merged manifest inside the working directory
pub const MERGED_MANIFEST_FILE: &str = "merged-istio-operator.yaml";

/// Total CPU capacity (4 cores, in nano-units) required for production
const PRODUCTION_CPU_NANOS: u128 = 4 * 1_000_000_000;

/// Total memory capacity (10G, in nano-units) required for production
const PRODUCTION_MEMORY_NANOS: u128 = 10 * 1_000_000_000 * 1_000_000_000;

// =============================================================================
// Cluster size
// =============================================================================

/// Size tier of the cluster, selecting the base manifest
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterSize {
    /// Small clusters get a reduced control plane
    Evaluation,
    /// Clusters with enough capacity for the full control plane
    Production,
}

impl ClusterSize {
    /// Derive the tier from the summed capacity of all nodes
    pub fn from_nodes(nodes: &[Node]) -> Result<Self> {
        let mut cpu: u128 = 0;
        let mut memory: u128 = 0;
        for node in nodes {
            let Some(capacity) = node.status.as_ref().and_then(|s| s.capacity.as_ref()) else {
                continue;
            };
            if let Some(q) = capacity.get("cpu") {
                cpu = cpu.saturating_add(parse_quantity(&q.0)?.as_nanos());
            }
            if let Some(q) = capacity.get("memory") {
                memory = memory.saturating_add(parse_quantity(&q.0)?.as_nanos());
            }
        }
        Ok(Self::from_capacity(cpu, memory))
    }

    /// Tier for a total capacity given in nano-units
    pub fn from_capacity(cpu_nanos: u128, memory_nanos: u128) -> Self {
        if cpu_nanos < PRODUCTION_CPU_NANOS || memory_nanos < PRODUCTION_MEMORY_NANOS {
            Self::Evaluation
        } else {
            Self::Production
        }
    }

    /// Base manifest file name for this tier
    pub fn manifest_file(&self) -> &'static str {
        match self {
            Self::Evaluation => EVALUATION_MANIFEST_FILE,
            Self::Production => PRODUCTION_MANIFEST_FILE,
        }
    }
}

impl fmt::Display for ClusterSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Evaluation => write!(f, "Evaluation"),
            Self::Production => write!(f, "Production"),
        }
    }
}

// =============================================================================
// Cluster flavour
// =============================================================================

/// Kubernetes distribution the mesh runs on
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClusterFlavour {
    /// No distribution specific overrides
    #[default]
    Unknown,
    /// k3s in docker
    K3d,
    /// Google Kubernetes Engine
    Gke,
    /// Gardener managed shoot
    Gardener,
    /// OpenShift, which requires the multus CNI provider
    Openshift,
}

impl ClusterFlavour {
    /// Discover the flavour from node versions and OS images
    pub fn discover(nodes: &[Node]) -> Result<Self> {
        let gke = compile(r"^v\d+\.\d+\.\d+-gke\.\d+$")?;
        let k3d = compile(r"^v\d+\.\d+\.\d+\+k3s\d+$")?;
        let gardener = compile(r"^Garden Linux \d+.\d+$")?;

        for info in nodes
            .iter()
            .filter_map(|n| n.status.as_ref().and_then(|s| s.node_info.as_ref()))
        {
            if gke.is_match(&info.kube_proxy_version) {
                return Ok(Self::Gke);
            }
            if k3d.is_match(&info.kube_proxy_version) {
                return Ok(Self::K3d);
            }
            if gardener.is_match(&info.os_image) {
                return Ok(Self::Gardener);
            }
        }
        Ok(Self::Unknown)
    }

    /// Whether [`Self::overrides`] needs the host of the cluster's gateway
    pub fn needs_gateway_host(&self) -> bool {
        matches!(self, Self::Gardener)
    }

    /// Override document merged on top of the configured manifest
    ///
    /// Gardener publishes the ingress gateway under `gateway_host`, which
    /// must be given for that flavour and is ignored for the others.
    pub fn overrides(&self, gateway_host: Option<&str>) -> Result<Value> {
        let overrides = match self {
            Self::K3d => json!({
                "spec": {"values": {
                    "cni": {
                        "cniBinDir": "/bin",
                        "cniConfDir": "/var/lib/rancher/k3s/agent/etc/cni/net.d",
                    },
                    "gateways": {"istio-ingressgateway": {
                        "serviceAnnotations": {GARDENER_DNS_NAMES_ANNOTATION: K3D_DNS_NAMES},
                    }},
                }}
            }),
            Self::Gke => json!({
                "spec": {"values": {"cni": {
                    "cniBinDir": "/home/kubernetes/bin",
                    "resourceQuotas": {"enabled": true},
                }}}
            }),
            Self::Openshift => json!({
                "spec": {"values": {"cni": {
                    "provider": "multus",
                    "chained": false,
                    "cniBinDir": "/var/lib/cni/bin",
                    "cniConfDir": "/etc/cni/multus/net.d",
                }}}
            }),
            Self::Gardener => {
                let host = gateway_host.ok_or_else(|| {
                    Error::internal_with_context(
                        "cluster-flavour",
                        "the gardener flavour needs the gateway host",
                    )
                })?;
                json!({
                    "spec": {"values": {"gateways": {"istio-ingressgateway": {
                        "podAnnotations": {GARDENER_DNS_NAMES_ANNOTATION: host},
                    }}}}
                })
            }
            Self::Unknown => json!({}),
        };
        Ok(overrides)
    }
}

/// First host of the first server of an Istio Gateway object
pub fn gateway_host(gateway: &Value) -> Result<String> {
    get_path(gateway, &["spec", "servers"])
        .and_then(Value::as_array)
        .and_then(|servers| servers.first())
        .and_then(|server| server.get("hosts"))
        .and_then(Value::as_array)
        .and_then(|hosts| hosts.first())
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            Error::manifest_with_context(
                "gateway",
                "expected at least one Host definition for the cluster Gateway",
            )
        })
}

impl fmt::Display for ClusterFlavour {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::K3d => "k3d",
            Self::Gke => "gke",
            Self::Gardener => "gardener",
            Self::Openshift => "openshift",
        };
        f.write_str(name)
    }
}

impl FromStr for ClusterFlavour {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "unknown" => Ok(Self::Unknown),
            "k3d" => Ok(Self::K3d),
            "gke" => Ok(Self::Gke),
            "gardener" => Ok(Self::Gardener),
            "openshift" => Ok(Self::Openshift),
            other => Err(Error::validation_for_field(
                "clusterFlavour",
                format!("unknown cluster flavour '{other}'"),
            )),
        }
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| Error::internal_with_context("flavour", e.to_string()))
}

// =============================================================================
// Manifest merger
// =============================================================================

/// Reads base manifests, merges configuration and writes the result
#[derive(Clone, Debug)]
pub struct ManifestMerger {
    manifest_dir: PathBuf,
    working_dir: PathBuf,
    hub: String,
    merger: StructuralMerger,
}

impl ManifestMerger {
    /// Create a merger reading from `manifest_dir` and writing to `working_dir`
    pub fn new(
        manifest_dir: impl Into<PathBuf>,
        working_dir: impl Into<PathBuf>,
        hub: impl Into<String>,
        merger: StructuralMerger,
    ) -> Self {
        Self {
            manifest_dir: manifest_dir.into(),
            working_dir: working_dir.into(),
            hub: hub.into(),
            merger,
        }
    }

    /// The structural merger in use
    pub fn structural(&self) -> &StructuralMerger {
        &self.merger
    }

    /// Image hub written into merged manifests
    pub fn hub(&self) -> &str {
        &self.hub
    }

    /// Load and parse the base manifest for a size tier
    pub fn base_manifest(&self, size: ClusterSize) -> Result<Value> {
        let path = self.manifest_dir.join(size.manifest_file());
        let content = std::fs::read_to_string(&path).map_err(|e| {
            Error::manifest_with_context("read", format!("{}: {e}", path.display()))
        })?;
        parse_manifest(&content)
    }

    /// Merge configuration onto the tier's base manifest without writing it
    pub fn render(
        &self,
        size: ClusterSize,
        desired: &DesiredConfiguration,
        overrides: &Value,
        tag: &str,
    ) -> Result<Value> {
        if tag.is_empty() {
            return Err(Error::manifest_with_context("render", "Istio tag cannot be empty"));
        }
        if self.hub.is_empty() {
            return Err(Error::manifest_with_context("render", "image hub cannot be empty"));
        }

        let base = self.base_manifest(size)?;
        let mut merged = self.merger.merge_with_overrides(&base, desired, overrides)?;
        let spec = object_at(&mut merged, &["spec"])?;
        spec.insert("hub".into(), self.hub.as_str().into());
        spec.insert("tag".into(), tag.into());
        Ok(merged)
    }

    /// Render the merged manifest and write it to the working directory
    pub fn merge(
        &self,
        size: ClusterSize,
        desired: &DesiredConfiguration,
        overrides: &Value,
        tag: &str,
    ) -> Result<MergedManifest> {
        let document = self.render(size, desired, overrides, tag)?;
        let path = self.working_dir.join(MERGED_MANIFEST_FILE);
        write_manifest(&path, &document)?;
        info!(
            path = %path.display(),
            cluster_size = %size,
            tag,
            "wrote merged manifest"
        );
        Ok(MergedManifest { path, document })
    }
}

/// A merged manifest and the file it was written to
#[derive(Clone, Debug)]
pub struct MergedManifest {
    /// Location handed to the installer
    pub path: PathBuf,
    /// The merged document
    pub document: Value,
}

impl MergedManifest {
    /// Sidecar proxy resources configured in this manifest
    pub fn proxy_resources(&self) -> Result<Resources> {
        proxy_resources(&self.document)
    }
}

fn write_manifest(path: &Path, doc: &Value) -> Result<()> {
    let yaml = to_yaml(doc)?;
    std::fs::write(path, yaml).map_err(|e| {
        Error::manifest_with_context("write", format!("{}: {e}", path.display()))
    })?;
    debug!(path = %path.display(), "manifest written");
    Ok(())
}

/// Sidecar proxy resources configured in a merged manifest
pub fn proxy_resources(merged: &Value) -> Result<Resources> {
    let resources = get_path(merged, &["spec", "values", "global", "proxy", "resources"])
        .filter(|v| !v.is_null())
        .ok_or_else(|| Error::manifest("proxy resources missing in merged manifest"))?;
    serde_json::from_value(resources.clone())
        .map_err(|e| Error::serialization_for_kind("proxy resources", e.to_string()))
}
