//! Runs one deployment end to end.

use crate::config::DeployConfig;
use crate::host::Host;
use crate::installer::{InstallReport, Installer};
use crate::preboot::{PrebootVerifier, VerificationReport};
use crate::staging::{stage_incoming, IncomingBundle};
use crate::validator::{compare_bundles, validate_structure, UpdateDecision};
use crate::workspace::{CleanupHook, Workspace};
use policybanner_common::{Error, Result, Timestamp};
use serde::Serialize;
use std::path::Path;
use tracing::{error, info};

pub const START_MARKER: &str = "==== PolicyBanner deployment started ====";
pub const FINISH_MARKER: &str = "==== PolicyBanner deployment finished ====";

/// Everything a finished run did.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentReport {
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
    pub incoming: IncomingBundle,
    pub decision: UpdateDecision,
    /// `None` when the installed bundle was already up to date.
    pub install: Option<InstallReport>,
    pub verification: VerificationReport,
}

/// Sequences privilege check, staging, validation, installation and
/// preboot verification.
pub struct Orchestrator<H: Host> {
    config: DeployConfig,
    host: H,
    cleanup: CleanupHook,
}

impl<H: Host> Orchestrator<H> {
    pub fn new(config: DeployConfig, host: H) -> Self {
        let cleanup = CleanupHook::new(&config.workspace_dir);
        Self {
            config,
            host,
            cleanup,
        }
    }

    pub fn config(&self) -> &DeployConfig {
        &self.config
    }

    /// Hook that removes the workspace; hand it to signal handlers before
    /// starting the run.
    pub fn cleanup_hook(&self) -> CleanupHook {
        self.cleanup.clone()
    }

    /// Run the deployment. Fatal errors are logged before being returned;
    /// the workspace is gone by the time this returns either way. Once the
    /// cleanup hook is released no further workspace can be created, so an
    /// orchestrator runs once.
    pub async fn run(&self) -> Result<DeploymentReport> {
        match self.run_steps().await {
            Ok(report) => {
                info!("{}", FINISH_MARKER);
                Ok(report)
            }
            Err(e) => {
                error!("Deployment aborted: {}", e);
                Err(e)
            }
        }
    }

    async fn run_steps(&self) -> Result<DeploymentReport> {
        let uid = self.host.effective_uid();
        if uid != 0 {
            return Err(Error::NotPrivileged { uid });
        }

        let started_at = Timestamp::now();
        info!("{}", START_MARKER);

        let workspace = Workspace::create(&self.cleanup)?;

        let incoming = stage_incoming(&self.config, &workspace)?;
        validate_structure(&incoming.path)?;

        prepare_install_dir(&self.config.install_dir)?;

        let decision = compare_bundles(&incoming.path, &self.config.installed_bundle())?;
        let install = if decision.needs_update() {
            Some(Installer::new(&self.config).deploy(&incoming.path, &workspace)?)
        } else {
            info!("Skipping backup, removal and install; verifying preboot volume only");
            None
        };

        workspace.ensure_open()?;
        let verification = PrebootVerifier::new(&self.config, &self.host)
            .verify()
            .await;

        workspace.destroy();

        Ok(DeploymentReport {
            started_at,
            finished_at: Timestamp::now(),
            incoming,
            decision,
            install,
            verification,
        })
    }
}

fn prepare_install_dir(dir: &Path) -> Result<()> {
    if dir.is_dir() {
        return Ok(());
    }

    std::fs::create_dir_all(dir).map_err(|source| Error::InstallDir {
        path: dir.to_path_buf(),
        source,
    })?;
    info!("Created install directory {}", dir.display());
    Ok(())
}
