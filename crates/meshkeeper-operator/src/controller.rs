//! MeshInstallation controller
//!
//! A reconcile loads the last applied configuration, gates the version
//! change, merges and installs the manifest, restarts stale proxies and
//! gateways, and folds every outcome into the resource status. The last
//! applied configuration is only recorded when nothing failed with Error
//! severity, so an interrupted upgrade is retried against the old baseline.
//!
//! Customer proxies are restarted in bounded rounds. While rounds remain the
//! resource stays Processing and is requeued after [`RESTART_REQUEUE`]; the
//! start of the first round is kept in the status so later rounds skip pods
//! that were already recreated.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use thiserror::Error as ThisError;
use tracing::{error, info, instrument, warn};

use meshkeeper_common::crd::{
    ConditionReason, MeshInstallation, MeshInstallationStatus, ReasonWithMessage,
};
use meshkeeper_common::{
    most_severe, DescribedOutcome, Error, Severity, LAST_APPLIED_CONFIGURATION_ANNOTATION,
};
use meshkeeper_config::{
    check_update, AppliedConfiguration, ClusterFlavour, ClusterSize, IstioVersion, ManifestMerger,
};
use meshkeeper_installer::{ExternalInstaller, MeshInstaller};
use meshkeeper_restart::{
    restart_all, EgressGatewayRestarter, IngressGatewayRestarter, KubeWorkloadClient,
    RestartInput, RestartRound, SidecarRestarter, WorkloadClient, WorkloadRestarter,
};

use crate::client::{KubeClient, KubeClientImpl};

/// Delay before a failed reconcile is retried
pub const ERROR_REQUEUE: Duration = Duration::from_secs(30);

/// Delay between rounds of a paced proxy restart
pub const RESTART_REQUEUE: Duration = Duration::from_secs(60);

/// Interval between reconciles of a healthy installation
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(10 * 60 * 60);

/// Errors returned from [`reconcile`]
#[derive(Debug, ThisError)]
pub enum ReconcileError {
    /// A Kubernetes call or bookkeeping step failed outside any reported outcome
    #[error(transparent)]
    Mesh(#[from] Error),

    /// A reconcile step failed; the failure is already recorded in the status
    #[error("{0}")]
    Failed(String),
}

/// Operator wide settings from the command line
#[derive(Clone, Debug)]
pub struct OperatorSettings {
    /// Istio version tag this operator installs
    pub istio_version: String,
    /// Fixed cluster flavour; discovered from the nodes when `None`
    pub cluster_flavour: Option<ClusterFlavour>,
    /// Requeue interval after a successful reconcile
    pub reconcile_interval: Duration,
}

impl OperatorSettings {
    /// Settings for `istio_version` with flavour discovery and the default interval
    pub fn new(istio_version: impl Into<String>) -> Self {
        Self {
            istio_version: istio_version.into(),
            cluster_flavour: None,
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
        }
    }

    /// Pin the cluster flavour instead of discovering it
    pub fn cluster_flavour(mut self, flavour: Option<ClusterFlavour>) -> Self {
        self.cluster_flavour = flavour;
        self
    }

    /// Override the reconcile interval
    pub fn reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }
}

/// Shared controller context
pub struct Context {
    /// Kubernetes client for MeshInstallations and nodes (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Installer for merged manifests
    pub installer: Arc<dyn MeshInstaller>,
    /// Restarters run after every installation, in order
    pub restarters: Vec<Arc<dyn WorkloadRestarter>>,
    /// Base manifests and merge configuration
    pub manifests: ManifestMerger,
    /// Operator settings
    pub settings: OperatorSettings,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(
        client: Client,
        manifests: ManifestMerger,
        settings: OperatorSettings,
    ) -> ContextBuilder {
        ContextBuilder {
            client,
            manifests,
            settings,
            kube: None,
            installer: None,
            restarters: None,
        }
    }

    /// Create a context for testing with custom mock clients
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn KubeClient>,
        installer: Arc<dyn MeshInstaller>,
        restarters: Vec<Arc<dyn WorkloadRestarter>>,
        manifests: ManifestMerger,
        settings: OperatorSettings,
    ) -> Self {
        Self {
            kube,
            installer,
            restarters,
            manifests,
            settings,
        }
    }
}

/// Builder for [`Context`]
///
/// Anything not overridden is backed by the real Kubernetes client.
pub struct ContextBuilder {
    client: Client,
    manifests: ManifestMerger,
    settings: OperatorSettings,
    kube: Option<Arc<dyn KubeClient>>,
    installer: Option<Arc<dyn MeshInstaller>>,
    restarters: Option<Vec<Arc<dyn WorkloadRestarter>>>,
}

impl ContextBuilder {
    /// Override the Kubernetes client
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the installer
    pub fn installer(mut self, installer: Arc<dyn MeshInstaller>) -> Self {
        self.installer = Some(installer);
        self
    }

    /// Override the restarters
    pub fn restarters(mut self, restarters: Vec<Arc<dyn WorkloadRestarter>>) -> Self {
        self.restarters = Some(restarters);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let client = self.client;
        let restarters = self.restarters.unwrap_or_else(|| {
            let workloads: Arc<dyn WorkloadClient> =
                Arc::new(KubeWorkloadClient::new(client.clone()));
            vec![
                Arc::new(SidecarRestarter::new(workloads.clone())) as Arc<dyn WorkloadRestarter>,
                Arc::new(IngressGatewayRestarter::new(workloads.clone())),
                Arc::new(EgressGatewayRestarter::new(workloads)),
            ]
        });
        Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(KubeClientImpl::new(client.clone()))),
            installer: self
                .installer
                .unwrap_or_else(|| Arc::new(ExternalInstaller::from_env())),
            restarters,
            manifests: self.manifests,
            settings: self.settings,
        }
    }
}

/// Where a reconcile stopped, and what the status should say about it
struct Stop {
    outcome: DescribedOutcome,
    reason: ReasonWithMessage,
}

impl Stop {
    fn new(outcome: DescribedOutcome, reason: ConditionReason) -> Self {
        Self {
            outcome,
            reason: ReasonWithMessage::new(reason),
        }
    }

    /// Use the underlying error text as the condition message
    fn explained(outcome: DescribedOutcome, reason: ConditionReason) -> Self {
        let message = outcome.error().to_string();
        Self {
            outcome,
            reason: ReasonWithMessage::with_message(reason, message),
        }
    }
}

/// What the installation and restart steps left to do
struct Installed {
    outcome: Option<DescribedOutcome>,
    more_remaining: bool,
}

/// Reconcile a MeshInstallation
#[instrument(skip(mesh, ctx), fields(installation = %mesh.name_any()))]
pub async fn reconcile(
    mesh: Arc<MeshInstallation>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    let name = mesh.name_any();
    let namespace = mesh.namespace().unwrap_or_default();
    let mut status = mesh.status.clone().unwrap_or_default();
    if status.observed_generation != mesh.metadata.generation {
        status.restarts_pending_since = None;
    }
    status.observed_generation = mesh.metadata.generation;

    if mesh.metadata.deletion_timestamp.is_some() {
        info!("installation is being deleted");
        status.update_to_deleting();
        ctx.kube.patch_status(&namespace, &name, &status).await?;
        return Ok(Action::await_change());
    }

    info!(version = %ctx.settings.istio_version, "reconciling mesh installation");
    status.update_to_processing("Reconciling the mesh installation");
    ctx.kube.patch_status(&namespace, &name, &status).await?;

    let Installed {
        outcome,
        more_remaining,
    } = match install_and_restart(&mesh, &ctx, &mut status).await? {
        Ok(installed) => installed,
        Err(stop) => return finish_with_outcome(&ctx, &namespace, &name, status, stop).await,
    };

    let blocking = outcome.as_ref().is_some_and(|o| !o.is_warning());
    if more_remaining && !blocking {
        status.update_to_requeued(RESTART_REQUEUE);
        ctx.kube.patch_status(&namespace, &name, &status).await?;
        info!(requeue_after = ?RESTART_REQUEUE, "proxy restarts continue in the next reconcile");
        return Ok(Action::requeue(RESTART_REQUEUE));
    }

    // Warnings still leave the installation at the new configuration
    if !blocking {
        status.restarts_pending_since = None;
        let applied = AppliedConfiguration::new(mesh.spec.clone(), &ctx.settings.istio_version);
        ctx.kube
            .record_applied(&namespace, &name, &applied.record()?)
            .await?;
    }

    match outcome {
        Some(outcome) => {
            let stop = Stop::new(outcome, ConditionReason::ReconcileFailed);
            finish_with_outcome(&ctx, &namespace, &name, status, stop).await
        }
        None => {
            status.update_to_ready(&ReasonWithMessage::new(ConditionReason::ReconcileSucceeded));
            ctx.kube.patch_status(&namespace, &name, &status).await?;
            info!("reconcile finished");
            Ok(Action::requeue(ctx.settings.reconcile_interval))
        }
    }
}

/// Run every step up to the restarts
///
/// The outer `Result` carries Kubernetes failures. The inner one either stops
/// the reconcile at a step or returns the reduced outcome of the steps that
/// do not block the installation.
async fn install_and_restart(
    mesh: &MeshInstallation,
    ctx: &Context,
    status: &mut MeshInstallationStatus,
) -> Result<Result<Installed, Stop>, Error> {
    let target = ctx.settings.istio_version.as_str();

    let annotation = mesh
        .annotations()
        .get(LAST_APPLIED_CONFIGURATION_ANNOTATION)
        .map(String::as_str);
    let applied = match AppliedConfiguration::load(annotation) {
        Ok(applied) => applied,
        Err(e) => {
            return Ok(Err(Stop::new(
                DescribedOutcome::new(e, "Could not read the last applied configuration"),
                ConditionReason::ReconcileFailed,
            )))
        }
    };

    let version = match IstioVersion::parse(target) {
        Ok(version) => version,
        Err(e) => {
            return Ok(Err(Stop::new(
                DescribedOutcome::new(e, "Invalid target Istio version"),
                ConditionReason::ReconcileFailed,
            )))
        }
    };
    if let Some(applied) = &applied {
        if let Err(e) = check_update(&applied.istio_tag, target) {
            status.set_condition(&ReasonWithMessage::with_message(
                ConditionReason::IstioVersionUpdateNotAllowed,
                e.to_string(),
            ));
            return Ok(Err(Stop::new(
                DescribedOutcome::new(e, "Istio version update is not allowed")
                    .warning()
                    .with_condition(false),
                ConditionReason::IstioVersionUpdateNotAllowed,
            )));
        }
    }
    let previous = applied.map(|a| a.config).unwrap_or_default();

    if let Err(e) = mesh.spec.validate() {
        return Ok(Err(Stop::explained(
            DescribedOutcome::new(e, "MeshInstallation is invalid"),
            ConditionReason::ValidationFailed,
        )));
    }
    let mut desired = mesh.spec.clone();
    let authorizer_outcome = match desired.validate_authorizers() {
        Ok(()) => None,
        Err(e) => {
            warn!(error = %e, "authorizers are not applied");
            desired.config.authorizers.clear();
            Some(DescribedOutcome::new(e, "Authorizers were not applied").warning())
        }
    };

    let nodes = ctx.kube.list_nodes().await?;
    let size = match ClusterSize::from_nodes(&nodes) {
        Ok(size) => size,
        Err(e) => {
            return Ok(Err(Stop::new(
                DescribedOutcome::new(e, "Could not determine the cluster size"),
                ConditionReason::ReconcileFailed,
            )))
        }
    };
    let flavour = match ctx.settings.cluster_flavour {
        Some(flavour) => flavour,
        None => match ClusterFlavour::discover(&nodes) {
            Ok(flavour) => flavour,
            Err(e) => {
                return Ok(Err(Stop::new(
                    DescribedOutcome::new(e, "Could not determine the cluster flavour"),
                    ConditionReason::ReconcileFailed,
                )))
            }
        },
    };
    info!(cluster_size = %size, cluster_flavour = %flavour, "selected base manifest");

    let gateway_host = match flavour.needs_gateway_host() {
        true => Some(ctx.kube.gateway_host().await),
        false => None,
    }
    .transpose();
    let overrides = match gateway_host.and_then(|host| flavour.overrides(host.as_deref())) {
        Ok(overrides) => overrides,
        Err(e) => {
            return Ok(Err(Stop::new(
                DescribedOutcome::new(e, "Could not build the cluster flavour overrides"),
                ConditionReason::ReconcileFailed,
            )))
        }
    };

    let merged = match ctx
        .manifests
        .merge(size, &desired, &overrides, target)
        .and_then(|merged| merged.proxy_resources().map(|r| (merged, r)))
    {
        Ok(merged) => merged,
        Err(e) => {
            return Ok(Err(Stop::new(
                DescribedOutcome::new(e, "Could not merge the Istio operator configuration"),
                ConditionReason::ReconcileFailed,
            )))
        }
    };
    let (merged, expected_resources) = merged;

    if let Err(e) = ctx
        .installer
        .install(&merged.path, &version, desired.is_compatibility_mode())
        .await
    {
        return Ok(Err(Stop::new(
            DescribedOutcome::new(e, "Istio installation failed"),
            ConditionReason::IstioInstallUninstallFailed,
        )));
    }
    status.set_condition(&ReasonWithMessage::new(
        ConditionReason::IstioInstallSucceeded,
    ));

    let restarts_pending_since = *status.restarts_pending_since.get_or_insert_with(Utc::now);
    let input = RestartInput {
        previous,
        desired,
        target_version: version,
        expected_image: format!("{}/proxyv2:{}", ctx.manifests.hub(), target),
        expected_resources,
        tables: ctx.manifests.structural().tables().clone(),
        restarts_pending_since: Some(restarts_pending_since),
    };
    let RestartRound {
        outcome,
        conditions,
        more_remaining,
    } = restart_all(&ctx.restarters, &input).await;
    for condition in &conditions {
        status.set_condition(condition);
    }

    Ok(Ok(Installed {
        outcome: most_severe([authorizer_outcome, outcome]),
        more_remaining,
    }))
}

/// Record a failed or degraded reconcile in the status and pick the follow-up
///
/// Retryable errors are returned so [`error_policy`] requeues them. Warnings
/// wait for the regular interval; other errors wait for a spec change.
async fn finish_with_outcome(
    ctx: &Context,
    namespace: &str,
    name: &str,
    mut status: MeshInstallationStatus,
    stop: Stop,
) -> Result<Action, ReconcileError> {
    let Stop { outcome, reason } = stop;
    let (requeue, action) = match outcome.severity() {
        Severity::Warning => (
            Some(ctx.settings.reconcile_interval),
            Action::requeue(ctx.settings.reconcile_interval),
        ),
        Severity::Error if outcome.error().is_retryable() => {
            (Some(ERROR_REQUEUE), Action::requeue(ERROR_REQUEUE))
        }
        Severity::Error => (None, Action::await_change()),
    };

    status.update_to_error(&outcome, &reason, requeue);
    ctx.kube.patch_status(namespace, name, &status).await?;

    match (outcome.severity(), requeue) {
        (Severity::Error, Some(_)) => {
            error!(outcome = %outcome, "reconcile failed");
            Err(ReconcileError::Failed(outcome.description()))
        }
        (severity, _) => {
            warn!(%severity, outcome = %outcome, "reconcile stopped");
            Ok(action)
        }
    }
}

/// Requeue a failed reconcile after [`ERROR_REQUEUE`]
pub fn error_policy(
    mesh: Arc<MeshInstallation>,
    error: &ReconcileError,
    _ctx: Arc<Context>,
) -> Action {
    error!(
        ?error,
        installation = %mesh.name_any(),
        "reconciliation failed"
    );
    Action::requeue(ERROR_REQUEUE)
}
