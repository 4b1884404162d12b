//! meshkeeper - keeps an Istio installation in sync with MeshInstallation resources

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use kube::{Client, CustomResourceExt};

use meshkeeper_common::crd::MeshInstallation;
use meshkeeper_common::telemetry::{init_telemetry, TelemetryConfig};
use meshkeeper_config::{ClusterFlavour, ManifestMerger, StructuralMerger};
use meshkeeper_installer::{ExternalInstaller, DEFAULT_INSTALLER_PATH, INSTALLER_PATH_ENV};
use meshkeeper_operator::controller_runner::{build_mesh_controller, ensure_crd_installed};
use meshkeeper_operator::{Context, OperatorSettings};

/// meshkeeper - Istio lifecycle operator
#[derive(Parser, Debug)]
#[command(name = "meshkeeper", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    Controller(ControllerArgs),
}

#[derive(Args, Debug)]
struct ControllerArgs {
    /// Directory holding the production and evaluation base manifests
    #[arg(long, env = "MANIFEST_DIR", default_value = "manifests")]
    manifest_dir: PathBuf,

    /// Directory the merged manifest is written to
    #[arg(long, env = "WORKING_DIR", default_value = "/tmp")]
    working_dir: PathBuf,

    /// Path of the Istio installer binary
    #[arg(long, env = INSTALLER_PATH_ENV, default_value = DEFAULT_INSTALLER_PATH)]
    installer_path: PathBuf,

    /// Istio version tag to install
    #[arg(long, env = "ISTIO_VERSION")]
    istio_version: String,

    /// Image hub for Istio images
    #[arg(long, env = "PROXY_IMAGE_HUB", default_value = "docker.io/istio")]
    proxy_image_hub: String,

    /// Fixed cluster flavour (unknown, k3d, gke, gardener, openshift);
    /// discovered from the nodes when unset
    #[arg(long, env = "CLUSTER_FLAVOUR")]
    cluster_flavour: Option<ClusterFlavour>,

    /// Seconds between reconciles of a healthy installation
    #[arg(long, env = "RECONCILE_INTERVAL_SECS", default_value_t = 36000)]
    reconcile_interval_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_telemetry(TelemetryConfig::default())?;

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&MeshInstallation::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    match cli.command {
        Some(Commands::Controller(args)) => run_controller(args).await,
        None => Err(anyhow::anyhow!(
            "no command given, run `meshkeeper controller --help`"
        )),
    }
}

async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    tracing::info!(version = %args.istio_version, "meshkeeper controller starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crd_installed(&client)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to install MeshInstallation CRD: {}", e))?;

    let manifests = ManifestMerger::new(
        args.manifest_dir,
        args.working_dir,
        args.proxy_image_hub,
        StructuralMerger::default(),
    );
    let settings = OperatorSettings::new(args.istio_version)
        .cluster_flavour(args.cluster_flavour)
        .reconcile_interval(Duration::from_secs(args.reconcile_interval_secs));
    let ctx = Context::builder(client.clone(), manifests, settings)
        .installer(Arc::new(ExternalInstaller::new(args.installer_path)))
        .build();

    build_mesh_controller(client, Arc::new(ctx)).await;

    tracing::info!("meshkeeper controller stopped");
    Ok(())
}
