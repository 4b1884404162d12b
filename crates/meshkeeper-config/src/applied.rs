//! Last-applied configuration snapshot
//!
//! After a successful reconcile the applied configuration and Istio tag are
//! stored together as one JSON annotation on the MeshInstallation. The next
//! reconcile compares against this snapshot to gate version changes and to
//! decide which workloads need a restart.

use serde::{Deserialize, Serialize};

use meshkeeper_common::crd::DesiredConfiguration;
use meshkeeper_common::{Error, Result};

/// Snapshot of the configuration and Istio tag last applied to the cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct AppliedConfiguration {
    /// Applied configuration, flattened next to the tag
    #[serde(flatten)]
    pub config: DesiredConfiguration,
    /// Istio tag that was installed
    #[serde(rename = "IstioTag", default)]
    pub istio_tag: String,
}

impl AppliedConfiguration {
    /// Build a snapshot
    pub fn new(config: DesiredConfiguration, istio_tag: impl Into<String>) -> Self {
        Self {
            config,
            istio_tag: istio_tag.into(),
        }
    }

    /// Serialize into the annotation value
    pub fn record(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::serialization_for_kind("last-applied-configuration", e.to_string()))
    }

    /// Load from the annotation value
    ///
    /// A missing annotation means nothing was applied yet. Malformed content
    /// is an error so that a corrupted annotation never silently resets the
    /// version gate.
    pub fn load(annotation: Option<&str>) -> Result<Option<Self>> {
        annotation
            .map(|raw| {
                serde_json::from_str(raw).map_err(|e| {
                    Error::serialization_for_kind("last-applied-configuration", e.to_string())
                })
            })
            .transpose()
    }
}
