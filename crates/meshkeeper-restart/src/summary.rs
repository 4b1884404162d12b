//! Bounded summary of workloads that could not be restarted

use std::fmt;

use tracing::info;

use crate::workload::WorkloadRef;

/// Workloads listed by name before the remainder is only counted
pub const SUMMARY_LIMIT: usize = 5;

/// A workload that could not be restarted
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RestartWarning {
    /// The workload concerned
    pub workload: WorkloadRef,
    /// Why the restart did not happen
    pub message: String,
}

impl RestartWarning {
    /// Build a warning
    pub fn new(workload: WorkloadRef, message: impl Into<String>) -> Self {
        Self {
            workload,
            message: message.into(),
        }
    }
}

impl fmt::Display for RestartWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.workload.kind.as_str(), self.workload, self.message)
    }
}

/// Summarize warnings, naming at most [`SUMMARY_LIMIT`] workloads
///
/// Returns `None` when there is nothing to report. Every warning is logged in
/// full.
pub fn summarize(warnings: &[RestartWarning]) -> Option<String> {
    if warnings.is_empty() {
        return None;
    }
    for warning in warnings {
        info!(
            namespace = %warning.workload.namespace,
            name = %warning.workload.name,
            kind = warning.workload.kind.as_str(),
            message = %warning.message,
            "proxy restart warning"
        );
    }

    let listed: Vec<String> = warnings
        .iter()
        .take(SUMMARY_LIMIT)
        .map(|w| w.workload.to_string())
        .collect();
    let mut summary = format!(
        "The sidecars of the following workloads could not be restarted: {}",
        listed.join(", ")
    );
    let remaining = warnings.len() - listed.len();
    if remaining > 0 {
        summary.push_str(&format!(" and {remaining} additional workload(s)"));
    }
    Some(summary)
}
