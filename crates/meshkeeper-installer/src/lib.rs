//! External Istio installer for meshkeeper
//!
//! The merged manifest is installed by a separate binary. The operator only
//! learns whether it succeeded; the process output goes to the logs and never
//! into the resource status.

#![deny(missing_docs)]

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, error, info};

#[cfg(test)]
use mockall::automock;

use meshkeeper_common::Error;
use meshkeeper_config::IstioVersion;

/// Environment variable overriding the installer binary location
pub const INSTALLER_PATH_ENV: &str = "ISTIO_INSTALL_BIN_PATH";

/// Installer binary used when [`INSTALLER_PATH_ENV`] is unset
pub const DEFAULT_INSTALLER_PATH: &str = "./istio_install";

/// Upper bound on a single installation run
pub const INSTALL_TIMEOUT: Duration = Duration::from_secs(6 * 60);

/// The only error text an installation failure ever reports
pub const INSTALL_FAILED_MESSAGE: &str = "istio installation resulted in an error";

/// Installs a merged manifest into the cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MeshInstaller: Send + Sync {
    /// Install `manifest` for `version`
    ///
    /// In compatibility mode the installer is pinned to the previous minor
    /// version's defaults.
    async fn install(
        &self,
        manifest: &Path,
        version: &IstioVersion,
        compatibility_mode: bool,
    ) -> Result<(), Error>;
}

/// Arguments passed to the installer binary
pub fn install_args(
    manifest: &Path,
    version: &IstioVersion,
    compatibility_mode: bool,
) -> Result<Vec<OsString>, Error> {
    let mut args = vec![manifest.as_os_str().to_os_string()];
    if compatibility_mode {
        args.push(format!("compatibilityVersion={}", version.previous_minor()?).into());
    }
    Ok(args)
}

/// [`MeshInstaller`] that runs an external binary
pub struct ExternalInstaller {
    binary: PathBuf,
    timeout: Duration,
}

impl ExternalInstaller {
    /// Installer running `binary` with the default timeout
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            timeout: INSTALL_TIMEOUT,
        }
    }

    /// Installer located through [`INSTALLER_PATH_ENV`]
    pub fn from_env() -> Self {
        let binary = std::env::var_os(INSTALLER_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_INSTALLER_PATH));
        Self::new(binary)
    }

    /// Override the timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The binary this installer runs
    pub fn binary(&self) -> &Path {
        &self.binary
    }
}

#[async_trait]
impl MeshInstaller for ExternalInstaller {
    async fn install(
        &self,
        manifest: &Path,
        version: &IstioVersion,
        compatibility_mode: bool,
    ) -> Result<(), Error> {
        let args = install_args(manifest, version, compatibility_mode)?;
        info!(binary = %self.binary.display(), args = ?args, %version, "running istio installer");

        let child = Command::new(&self.binary)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                error!(binary = %self.binary.display(), error = %e, "failed to start istio installer");
                Error::installation(INSTALL_FAILED_MESSAGE)
            })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                error!(error = %e, "istio installer did not complete");
                return Err(Error::installation(INSTALL_FAILED_MESSAGE));
            }
            Err(_) => {
                error!(timeout = ?self.timeout, "istio installer timed out");
                return Err(Error::installation(INSTALL_FAILED_MESSAGE));
            }
        };

        debug!(
            stdout = %String::from_utf8_lossy(&output.stdout),
            stderr = %String::from_utf8_lossy(&output.stderr),
            "istio installer output"
        );

        if !output.status.success() {
            error!(status = %output.status, "istio installer failed");
            return Err(Error::installation(INSTALL_FAILED_MESSAGE));
        }
        info!(%version, "istio installation completed");
        Ok(())
    }
}
