//! Status of a MeshInstallation: lifecycle state plus conditions
//!
//! Every [`ConditionReason`] maps to exactly one condition type, condition
//! status and default message. Callers may replace the message through
//! [`ReasonWithMessage`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::outcome::{DescribedOutcome, Severity};

/// Lifecycle state of the managed installation
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum State {
    /// A reconcile is in progress
    #[default]
    Processing,
    /// The installation matches the desired configuration
    Ready,
    /// The last reconcile failed
    Error,
    /// The last reconcile finished with a non-fatal problem
    Warning,
    /// The installation is being removed
    Deleting,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            State::Processing => write!(f, "Processing"),
            State::Ready => write!(f, "Ready"),
            State::Error => write!(f, "Error"),
            State::Warning => write!(f, "Warning"),
            State::Deleting => write!(f, "Deleting"),
        }
    }
}

/// Condition status values
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition holds
    True,
    /// Condition does not hold
    False,
    /// Not yet determined
    #[default]
    Unknown,
}

/// Condition types reported on the resource
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConditionType {
    /// Overall readiness of the installation
    Ready,
    /// Outcome of the last sidecar restart pass
    ProxySidecarRestartSucceeded,
}

impl ConditionType {
    /// Name used in the condition's `type` field
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionType::Ready => "Ready",
            ConditionType::ProxySidecarRestartSucceeded => "ProxySidecarRestartSucceeded",
        }
    }
}

/// Machine readable reason of a condition
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConditionReason {
    /// Reconcile finished without problems
    ReconcileSucceeded,
    /// Reconcile failed
    ReconcileFailed,
    /// Proxy restarts are paced over several reconciles
    ReconcileRequeued,
    /// Desired configuration failed validation
    ValidationFailed,
    /// External installer finished successfully
    IstioInstallSucceeded,
    /// External installer failed
    IstioInstallUninstallFailed,
    /// Version gate rejected the target version
    IstioVersionUpdateNotAllowed,
    /// All sidecars restarted
    ProxySidecarRestartSucceeded,
    /// Sidecar restart failed
    ProxySidecarRestartFailed,
    /// Some sidecars could not be restarted
    ProxySidecarRestartPartiallySucceeded,
    /// Some workloads need a manual restart
    ProxySidecarManualRestartRequired,
    /// Ingress gateway restarted
    IngressGatewayRestartSucceeded,
    /// Ingress gateway restart failed
    IngressGatewayRestartFailed,
    /// Egress gateway restarted
    EgressGatewayRestartSucceeded,
    /// Egress gateway restart failed
    EgressGatewayRestartFailed,
}

impl ConditionReason {
    /// Reason name used in the condition's `reason` field
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionReason::ReconcileSucceeded => "ReconcileSucceeded",
            ConditionReason::ReconcileFailed => "ReconcileFailed",
            ConditionReason::ReconcileRequeued => "ReconcileRequeued",
            ConditionReason::ValidationFailed => "ValidationFailed",
            ConditionReason::IstioInstallSucceeded => "IstioInstallSucceeded",
            ConditionReason::IstioInstallUninstallFailed => "IstioInstallUninstallFailed",
            ConditionReason::IstioVersionUpdateNotAllowed => "IstioVersionUpdateNotAllowed",
            ConditionReason::ProxySidecarRestartSucceeded => "ProxySidecarRestartSucceeded",
            ConditionReason::ProxySidecarRestartFailed => "ProxySidecarRestartFailed",
            ConditionReason::ProxySidecarRestartPartiallySucceeded => {
                "ProxySidecarRestartPartiallySucceeded"
            }
            ConditionReason::ProxySidecarManualRestartRequired => {
                "ProxySidecarManualRestartRequired"
            }
            ConditionReason::IngressGatewayRestartSucceeded => "IngressGatewayRestartSucceeded",
            ConditionReason::IngressGatewayRestartFailed => "IngressGatewayRestartFailed",
            ConditionReason::EgressGatewayRestartSucceeded => "EgressGatewayRestartSucceeded",
            ConditionReason::EgressGatewayRestartFailed => "EgressGatewayRestartFailed",
        }
    }

    /// Condition type, condition status and default message for this reason
    pub fn meta(&self) -> (ConditionType, ConditionStatus, &'static str) {
        use ConditionStatus::{False, True};
        use ConditionType::{ProxySidecarRestartSucceeded as Sidecar, Ready};

        match self {
            ConditionReason::ReconcileSucceeded => (Ready, True, "Reconciliation succeeded"),
            ConditionReason::ReconcileFailed => (Ready, False, "Reconciliation failed"),
            ConditionReason::ReconcileRequeued => (
                Ready,
                False,
                "Proxy reset is still ongoing. Reconciliation requeued",
            ),
            ConditionReason::ValidationFailed => (
                Ready,
                False,
                "Reconciliation did not happen as the MeshInstallation failed to validate",
            ),
            ConditionReason::IstioInstallSucceeded => {
                (Ready, False, "Istio installation succeeded")
            }
            ConditionReason::IstioInstallUninstallFailed => {
                (Ready, False, "Istio install or uninstall failed")
            }
            ConditionReason::IstioVersionUpdateNotAllowed => {
                (Ready, False, "Update to the new Istio version is not allowed")
            }
            ConditionReason::ProxySidecarRestartSucceeded => {
                (Sidecar, True, "Proxy sidecar restart succeeded")
            }
            ConditionReason::ProxySidecarRestartFailed => {
                (Sidecar, False, "Proxy sidecar restart failed")
            }
            ConditionReason::ProxySidecarRestartPartiallySucceeded => {
                (Sidecar, False, "Proxy sidecar restart partially succeeded")
            }
            ConditionReason::ProxySidecarManualRestartRequired => (
                Sidecar,
                False,
                "Proxy sidecar manual restart is required for some workloads",
            ),
            ConditionReason::IngressGatewayRestartSucceeded => {
                (Ready, False, "Istio Ingress Gateway restart succeeded")
            }
            ConditionReason::IngressGatewayRestartFailed => {
                (Ready, False, "Istio Ingress Gateway restart failed")
            }
            ConditionReason::EgressGatewayRestartSucceeded => {
                (Ready, False, "Istio Egress Gateway restart succeeded")
            }
            ConditionReason::EgressGatewayRestartFailed => {
                (Ready, False, "Istio Egress Gateway restart failed")
            }
        }
    }
}

/// A reason with an optional custom message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReasonWithMessage {
    /// The reason
    pub reason: ConditionReason,
    /// Custom message; empty means use the reason's default
    pub message: String,
}

impl ReasonWithMessage {
    /// Reason using its default message
    pub fn new(reason: ConditionReason) -> Self {
        Self {
            reason,
            message: String::new(),
        }
    }

    /// Reason with a custom message
    pub fn with_message(reason: ConditionReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }

    /// Build the condition for this reason
    pub fn condition(&self) -> Condition {
        let (type_, status, default_message) = self.reason.meta();
        let message = if self.message.is_empty() {
            default_message.to_string()
        } else {
            self.message.clone()
        };
        Condition::new(type_.as_str(), status, self.reason.as_str(), message)
    }
}

/// Kubernetes-style condition
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition
    #[serde(rename = "type")]
    pub type_: String,
    /// Status of the condition
    pub status: ConditionStatus,
    /// Machine-readable reason
    pub reason: String,
    /// Human-readable message
    pub message: String,
    /// Last time the condition status changed
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

/// Observed status of a MeshInstallation
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MeshInstallationStatus {
    /// Lifecycle state
    #[serde(default)]
    pub state: State,

    /// Human readable description of the state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Generation observed by the last reconcile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Status conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Start of a proxy restart that spans several reconciles
    ///
    /// Pods created after this instant already run the new configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restarts_pending_since: Option<DateTime<Utc>>,
}

impl MeshInstallationStatus {
    /// Set or replace the condition of the same type
    ///
    /// The transition time is kept when the status does not change.
    pub fn set_condition(&mut self, reason: &ReasonWithMessage) {
        let mut condition = reason.condition();
        if let Some(existing) = self
            .conditions
            .iter_mut()
            .find(|c| c.type_ == condition.type_)
        {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
            *existing = condition;
        } else {
            self.conditions.push(condition);
        }
    }

    /// Find a condition by type
    pub fn condition(&self, type_: ConditionType) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_.as_str())
    }

    /// Mark as processing
    pub fn update_to_processing(&mut self, description: impl Into<String>) {
        self.state = State::Processing;
        self.description = Some(description.into());
    }

    /// Mark as ready and record the reason
    pub fn update_to_ready(&mut self, reason: &ReasonWithMessage) {
        self.state = State::Ready;
        self.description = None;
        self.set_condition(reason);
    }

    /// Mark as processing while proxy restarts continue in a later reconcile
    pub fn update_to_requeued(&mut self, requeue_after: Duration) {
        let reason = ReasonWithMessage::new(ConditionReason::ReconcileRequeued);
        self.state = State::Processing;
        self.description = Some(format!(
            "{}\nWill be reconciled again in {}s",
            reason.condition().message,
            requeue_after.as_secs()
        ));
        self.set_condition(&reason);
    }

    /// Mark as deleting; conditions are left as they are
    pub fn update_to_deleting(&mut self) {
        self.state = State::Deleting;
        self.description = Some("Deleting the mesh installation".to_string());
    }

    /// Record a failed reconcile
    ///
    /// Warnings put the resource into the Warning state, errors into Error.
    /// The description states when the next reconcile happens.
    pub fn update_to_error(
        &mut self,
        outcome: &DescribedOutcome,
        reason: &ReasonWithMessage,
        requeue_after: Option<Duration>,
    ) {
        self.state = match outcome.severity() {
            Severity::Warning => State::Warning,
            Severity::Error => State::Error,
        };
        let next = match requeue_after {
            Some(after) => format!("\nWill be reconciled again in {}s", after.as_secs()),
            None => "\nWill not reconcile automatically".to_string(),
        };
        self.description = Some(format!("{}{}", outcome.description(), next));
        if outcome.should_set_condition() {
            self.set_condition(reason);
        }
    }
}
