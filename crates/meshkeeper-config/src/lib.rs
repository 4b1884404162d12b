//! Configuration engine for meshkeeper
//!
//! Turns a [`DesiredConfiguration`](meshkeeper_common::crd::DesiredConfiguration)
//! into the IstioOperator manifest handed to the installer, gates version
//! changes, and tracks the last applied configuration.

#![deny(missing_docs)]

pub mod applied;
pub mod compatibility;
pub mod deep_merge;
pub mod manifest;
pub mod merger;
pub mod version;

pub use applied::AppliedConfiguration;
pub use compatibility::CompatibilityTables;
pub use manifest::{
    gateway_host, proxy_resources, ClusterFlavour, ClusterSize, ManifestMerger, MergedManifest,
};
pub use merger::StructuralMerger;
pub use version::{check_update, IstioVersion};
