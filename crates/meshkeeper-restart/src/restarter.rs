//! Restarters that recreate proxies and gateways after a configuration change
//!
//! Each [`WorkloadRestarter`] reports a [`RestartReport`] instead of failing
//! the reconcile. The controller records every condition and reduces the
//! outcomes with [`most_severe`].

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use meshkeeper_common::crd::{ConditionReason, DesiredConfiguration, ReasonWithMessage, Resources};
use meshkeeper_common::{
    most_severe, DescribedOutcome, Error, EGRESS_GATEWAY_NAME, INGRESS_GATEWAY_NAME,
    ISTIO_SYSTEM_NAMESPACE,
};
use meshkeeper_config::{CompatibilityTables, IstioVersion};

use crate::client::WorkloadClient;
use crate::evaluator::{any_matches, select_pods};
use crate::predicates::{ConfigChange, ConfigDiff, SidecarPredicate};
use crate::summary::{summarize, RestartWarning};
use crate::workload::{
    control_plane_version, pod_name, pod_namespace, pod_owner, resolve_direct_action,
    resolve_replica_set_action, RestartAction, WorkloadKind, WorkloadRef,
};

/// Description of a failed sidecar reconciliation
pub const SIDECAR_FAILURE_DESCRIPTION: &str = "Error occurred during reconciliation of Istio Sidecars";

/// Description of a partially failed sidecar restart
pub const SIDECAR_WARNING_DESCRIPTION: &str = "Not all pods with Istio injection could be restarted. \
Please take a look at the operator logs to see more information about the warning";

/// Customer workloads restarted per reconcile; the rest wait for a requeue
pub const CUSTOMER_RESTART_LIMIT: usize = 30;

const SIDECAR_WARNING_ERROR: &str =
    "Istio controller could not restart one or more istio-injected pods.";

/// Everything a restarter needs to compare the applied and desired state
#[derive(Clone, Debug)]
pub struct RestartInput {
    /// Configuration that was last applied to the cluster
    pub previous: DesiredConfiguration,
    /// Configuration being reconciled
    pub desired: DesiredConfiguration,
    /// Istio version the control plane must run before proxies restart
    pub target_version: IstioVersion,
    /// Proxy image every sidecar should run
    pub expected_image: String,
    /// Proxy resources from the merged manifest
    pub expected_resources: Resources,
    /// Compatibility tables of the target version
    pub tables: CompatibilityTables,
    /// Start of a restart spread over several reconciles
    ///
    /// Pods created at or after this instant are left alone.
    pub restarts_pending_since: Option<DateTime<Utc>>,
}

impl RestartInput {
    fn config_diff(&self) -> ConfigDiff<'_> {
        ConfigDiff {
            previous: &self.previous.config,
            desired: &self.desired.config,
        }
    }

    fn predates_restart(&self, pod: &Pod) -> bool {
        match (self.restarts_pending_since, &pod.metadata.creation_timestamp) {
            (Some(since), Some(created)) => created.0 < since,
            _ => true,
        }
    }
}

/// Result of one restarter run
#[derive(Debug)]
pub struct RestartReport {
    /// Failure or warning, `None` on success
    pub outcome: Option<DescribedOutcome>,
    /// Condition to record on the resource
    pub condition: ReasonWithMessage,
    /// Restarts were left for a later reconcile
    pub more_remaining: bool,
}

impl RestartReport {
    fn succeeded(reason: ConditionReason) -> Self {
        Self {
            outcome: None,
            condition: ReasonWithMessage::new(reason),
            more_remaining: false,
        }
    }

    fn failed(reason: ConditionReason, outcome: DescribedOutcome) -> Self {
        Self {
            outcome: Some(outcome),
            condition: ReasonWithMessage::new(reason),
            more_remaining: false,
        }
    }
}

/// A unit of restart work run by the controller after installation
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkloadRestarter: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// Restart whatever the transition in `input` requires
    async fn restart(&self, input: &RestartInput) -> RestartReport;
}

/// Combined result of every restarter
#[derive(Debug)]
pub struct RestartRound {
    /// Most severe outcome
    pub outcome: Option<DescribedOutcome>,
    /// One condition per restarter, in run order
    pub conditions: Vec<ReasonWithMessage>,
    /// Some restarter left work for a later reconcile
    pub more_remaining: bool,
}

/// Run every restarter, keeping the most severe outcome and all conditions
pub async fn restart_all(
    restarters: &[Arc<dyn WorkloadRestarter>],
    input: &RestartInput,
) -> RestartRound {
    let mut outcomes = Vec::with_capacity(restarters.len());
    let mut conditions = Vec::with_capacity(restarters.len());
    let mut more_remaining = false;
    for restarter in restarters {
        let report = restarter.restart(input).await;
        if let Some(outcome) = &report.outcome {
            warn!(restarter = restarter.name(), outcome = %outcome, "restarter reported a problem");
        }
        if report.more_remaining {
            info!(restarter = restarter.name(), "restarts continue in a later reconcile");
        }
        more_remaining |= report.more_remaining;
        outcomes.push(report.outcome);
        conditions.push(report.condition);
    }
    RestartRound {
        outcome: most_severe(outcomes),
        conditions,
        more_remaining,
    }
}

// =============================================================================
// Sidecars
// =============================================================================

/// Which pods a sidecar pass covers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Scope {
    Platform,
    Customer,
}

impl Scope {
    fn gate(self) -> SidecarPredicate {
        match self {
            Scope::Platform => SidecarPredicate::PlatformWorkload,
            Scope::Customer => SidecarPredicate::CustomerWorkload,
        }
    }

    /// Platform restarts must all succeed; customer problems only warn
    fn fail_on_error(self) -> bool {
        self == Scope::Platform
    }

    fn limit(self) -> Option<usize> {
        match self {
            Scope::Platform => None,
            Scope::Customer => Some(CUSTOMER_RESTART_LIMIT),
        }
    }
}

/// Workloads acted on by one pass
#[derive(Debug, Default)]
struct PassResult {
    warnings: Vec<RestartWarning>,
    more_remaining: bool,
}

/// Restarts injected pods whose proxy no longer matches the desired state
pub struct SidecarRestarter {
    client: Arc<dyn WorkloadClient>,
}

impl SidecarRestarter {
    /// Create a restarter that acts through `client`
    pub fn new(client: Arc<dyn WorkloadClient>) -> Self {
        Self { client }
    }

    /// Act on every selected pod, at most once per owner
    ///
    /// With `fail_on_error` an owner that cannot be looked up aborts the pass.
    /// Without it the owner is reported as a warning and the pass goes on.
    /// Once `limit` workloads were rolled out or deleted the pass stops and
    /// flags the rest as remaining.
    async fn restart_pods(
        &self,
        pods: &[&Pod],
        fail_on_error: bool,
        limit: Option<usize>,
    ) -> Result<PassResult, Error> {
        let mut result = PassResult::default();
        let mut handled: HashSet<WorkloadRef> = HashSet::new();
        let mut restarted = 0;

        for pod in pods {
            let action = match resolve_direct_action(pod) {
                Some(action) => action,
                None => match self.resolve_through_replica_set(pod).await {
                    Ok(action) => action,
                    Err(e) if fail_on_error => return Err(e),
                    Err(e) => {
                        warn!(
                            namespace = pod_namespace(pod),
                            pod = pod_name(pod),
                            error = %e,
                            "failed to resolve proxy owner"
                        );
                        result
                            .warnings
                            .push(RestartWarning::new(replica_set_owner(pod), e.to_string()));
                        continue;
                    }
                },
            };
            if handled.contains(action.target()) {
                continue;
            }
            let restarts = matches!(action, RestartAction::Rollout(_) | RestartAction::DeletePod(_));
            if restarts && limit.is_some_and(|limit| restarted >= limit) {
                result.more_remaining = true;
                break;
            }
            handled.insert(action.target().clone());

            let outcome = match &action {
                RestartAction::Rollout(workload) => self.client.rollout(workload).await,
                RestartAction::DeletePod(workload) => {
                    self.client
                        .delete_pod(&workload.namespace, &workload.name)
                        .await
                }
                RestartAction::Warn { workload, message } => {
                    result
                        .warnings
                        .push(RestartWarning::new(workload.clone(), *message));
                    Ok(())
                }
                RestartAction::Skip(workload) => {
                    info!(%workload, "rollout already in progress, skipping restart");
                    Ok(())
                }
            };
            if restarts {
                restarted += 1;
            }
            if let Err(e) = outcome {
                warn!(
                    namespace = pod_namespace(pod),
                    pod = pod_name(pod),
                    error = %e,
                    "failed to restart proxy"
                );
                result
                    .warnings
                    .push(RestartWarning::new(action.target().clone(), e.to_string()));
            }
        }
        Ok(result)
    }

    async fn resolve_through_replica_set(&self, pod: &Pod) -> Result<RestartAction, Error> {
        let namespace = pod_namespace(pod);
        let owner = pod_owner(pod).map(|o| o.name.as_str()).unwrap_or_default();
        let replica_set = self.client.get_replica_set(namespace, owner).await?;
        let siblings = match &replica_set {
            Some(_) => self.client.list_replica_sets(namespace).await?,
            None => Vec::new(),
        };
        Ok(resolve_replica_set_action(
            pod,
            replica_set.as_ref(),
            &siblings,
        ))
    }

    async fn run_pass(
        &self,
        scope: Scope,
        pods: &[Pod],
        input: &RestartInput,
    ) -> Result<PassResult, Error> {
        let mut predicates = SidecarPredicate::for_transition(
            &input.previous,
            &input.desired,
            &input.tables,
            input.expected_image.clone(),
            input.expected_resources.clone(),
        );
        predicates.push(scope.gate());
        let selected: Vec<&Pod> = select_pods(pods, &predicates)
            .into_iter()
            .filter(|pod| input.predates_restart(pod))
            .collect();
        info!(scope = ?scope, pods = selected.len(), "restarting proxies");
        self.restart_pods(&selected, scope.fail_on_error(), scope.limit())
            .await
    }

    /// Refuse to restart proxies until the system namespace runs the target version
    async fn check_control_plane(&self, target: &IstioVersion) -> Result<(), Error> {
        let pods = self.client.list_pods(ISTIO_SYSTEM_NAMESPACE, "").await?;
        let installed = control_plane_version(&pods)?;
        if installed != *target {
            return Err(Error::restart(
                ISTIO_SYSTEM_NAMESPACE,
                format!(
                    "istio-system pods version: {installed} do not match target version: {target}"
                ),
            ));
        }
        debug!(version = %installed, "control plane runs the target version");
        Ok(())
    }
}

/// The ReplicaSet a pod names as owner, or the pod itself
fn replica_set_owner(pod: &Pod) -> WorkloadRef {
    match pod_owner(pod) {
        Some(owner) => WorkloadRef::new(WorkloadKind::ReplicaSet, pod_namespace(pod), &owner.name),
        None => WorkloadRef::for_pod(pod),
    }
}

#[async_trait]
impl WorkloadRestarter for SidecarRestarter {
    fn name(&self) -> &'static str {
        "sidecars"
    }

    #[instrument(skip(self, input), fields(target = %input.target_version))]
    async fn restart(&self, input: &RestartInput) -> RestartReport {
        let failed = |error: Error| {
            RestartReport::failed(
                ConditionReason::ProxySidecarRestartFailed,
                DescribedOutcome::new(error, SIDECAR_FAILURE_DESCRIPTION),
            )
        };

        if let Err(e) = self.check_control_plane(&input.target_version).await {
            return failed(e);
        }

        let pods = match self.client.list_running_pods().await {
            Ok(pods) => pods,
            Err(e) => return failed(e),
        };

        match self.run_pass(Scope::Platform, &pods, input).await {
            Ok(platform) if platform.warnings.is_empty() => {}
            Ok(platform) => {
                let listed: Vec<String> =
                    platform.warnings.iter().map(ToString::to_string).collect();
                return failed(Error::restart(
                    "platform workloads",
                    listed.join("; "),
                ));
            }
            Err(e) => return failed(e),
        }

        let customer = match self.run_pass(Scope::Customer, &pods, input).await {
            Ok(customer) => customer,
            Err(e) => return failed(e),
        };

        let outcome = summarize(&customer.warnings).map(|summary| {
            let outcome = DescribedOutcome::new(
                Error::restart("customer workloads", SIDECAR_WARNING_ERROR),
                SIDECAR_WARNING_DESCRIPTION,
            )
            .warning();
            (outcome, summary)
        });
        match (customer.more_remaining, outcome) {
            (true, outcome) => RestartReport {
                outcome: outcome.map(|(outcome, _)| outcome),
                condition: ReasonWithMessage::new(
                    ConditionReason::ProxySidecarRestartPartiallySucceeded,
                ),
                more_remaining: true,
            },
            (false, None) => RestartReport::succeeded(ConditionReason::ProxySidecarRestartSucceeded),
            (false, Some((outcome, summary))) => RestartReport {
                outcome: Some(outcome),
                condition: ReasonWithMessage::with_message(
                    ConditionReason::ProxySidecarManualRestartRequired,
                    summary,
                ),
                more_remaining: false,
            },
        }
    }
}

// =============================================================================
// Gateways
// =============================================================================

fn gateway_deployment(name: &str) -> WorkloadRef {
    WorkloadRef::new(WorkloadKind::Deployment, ISTIO_SYSTEM_NAMESPACE, name)
}

/// Restarts the ingress gateway when a gateway-facing mesh setting changed
pub struct IngressGatewayRestarter {
    client: Arc<dyn WorkloadClient>,
}

impl IngressGatewayRestarter {
    /// Create a restarter that acts through `client`
    pub fn new(client: Arc<dyn WorkloadClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WorkloadRestarter for IngressGatewayRestarter {
    fn name(&self) -> &'static str {
        "ingress-gateway"
    }

    async fn restart(&self, input: &RestartInput) -> RestartReport {
        let failed = |error: Error, description: &str| {
            RestartReport::failed(
                ConditionReason::IngressGatewayRestartFailed,
                DescribedOutcome::new(error, description),
            )
        };

        let pods = match self
            .client
            .list_pods(ISTIO_SYSTEM_NAMESPACE, &format!("app={INGRESS_GATEWAY_NAME}"))
            .await
        {
            Ok(pods) => pods,
            Err(e) => return failed(e, "Failed to get ingress gateway pods"),
        };
        if pods.is_empty() || !any_matches(ConfigChange::INGRESS_GATEWAY, &input.config_diff()) {
            return RestartReport::succeeded(ConditionReason::IngressGatewayRestartSucceeded);
        }

        if let Err(e) = self.client.rollout(&gateway_deployment(INGRESS_GATEWAY_NAME)).await {
            return failed(e, "Failed to restart ingress gateway");
        }
        info!(gateway = INGRESS_GATEWAY_NAME, "restarted gateway");
        RestartReport::succeeded(ConditionReason::IngressGatewayRestartSucceeded)
    }
}

/// Restarts the egress gateway when the trusted proxy count changed
///
/// The Deployment is patched directly; a cluster without an egress gateway
/// counts as restarted.
pub struct EgressGatewayRestarter {
    client: Arc<dyn WorkloadClient>,
}

impl EgressGatewayRestarter {
    /// Create a restarter that acts through `client`
    pub fn new(client: Arc<dyn WorkloadClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WorkloadRestarter for EgressGatewayRestarter {
    fn name(&self) -> &'static str {
        "egress-gateway"
    }

    async fn restart(&self, input: &RestartInput) -> RestartReport {
        if !any_matches(ConfigChange::EGRESS_GATEWAY, &input.config_diff()) {
            return RestartReport::succeeded(ConditionReason::EgressGatewayRestartSucceeded);
        }
        match self.client.rollout(&gateway_deployment(EGRESS_GATEWAY_NAME)).await {
            Ok(()) => info!(gateway = EGRESS_GATEWAY_NAME, "restarted gateway"),
            Err(e) if e.is_not_found() => {
                debug!(gateway = EGRESS_GATEWAY_NAME, "gateway not installed, nothing to restart")
            }
            Err(e) => {
                return RestartReport::failed(
                    ConditionReason::EgressGatewayRestartFailed,
                    DescribedOutcome::new(e, "Failed to restart egress gateway"),
                )
            }
        }
        RestartReport::succeeded(ConditionReason::EgressGatewayRestartSucceeded)
    }
}
