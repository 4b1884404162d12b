//! meshkeeper operator
//!
//! Reconciles `MeshInstallation` resources: merges the desired configuration
//! into an IstioOperator manifest, runs the installer and restarts proxies
//! that no longer match the installed mesh.

#![deny(missing_docs)]

pub mod client;
pub mod controller;
pub mod controller_runner;

pub use controller::{error_policy, reconcile, Context, OperatorSettings, ReconcileError};
