//! Restart decisions and restart actions for meshkeeper
//!
//! Predicates decide which running proxies and gateways are stale after a
//! configuration change. Restarters act on those decisions through a
//! [`WorkloadClient`].

#![deny(missing_docs)]

pub mod client;
pub mod evaluator;
pub mod predicates;
pub mod restarter;
pub mod summary;
pub mod workload;

pub use client::{KubeWorkloadClient, WorkloadClient};
pub use evaluator::{any_matches, requires_restart, select_pods};
pub use predicates::{ConfigChange, ConfigDiff, Predicate, SidecarPredicate};
pub use restarter::{
    restart_all, EgressGatewayRestarter, IngressGatewayRestarter, RestartInput, RestartReport,
    RestartRound, SidecarRestarter, WorkloadRestarter, CUSTOMER_RESTART_LIMIT,
};
pub use summary::{summarize, RestartWarning, SUMMARY_LIMIT};
pub use workload::{control_plane_version, RestartAction, WorkloadKind, WorkloadRef};
