//! PolicyBanner - replace the macOS login-window policy banner and resync
//! the FileVault preboot volume.

use clap::{Parser, ValueEnum};
use policybanner_deployer::config::{
    DEFAULT_INSTALL_DIR, DEFAULT_LOG_PATH, DEFAULT_PREBOOT_MARKER, DEFAULT_STAGING_DIR,
};
use policybanner_deployer::host::SystemHost;
use policybanner_deployer::shutdown::{terminate, SHUTDOWN_GRACE};
use policybanner_deployer::workspace::CleanupHook;
use policybanner_deployer::{logger, DeployConfig, DeploymentReport, Orchestrator};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::{error, warn};

const SIGHUP: i32 = 1;
const SIGINT: i32 = 2;
const SIGTERM: i32 = 15;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Parser)]
#[command(name = "policybanner")]
#[command(
    author,
    version,
    about = "Replace the login-window PolicyBanner and resync the FileVault preboot volume"
)]
struct Cli {
    /// Enable debug records
    #[arg(short, long)]
    verbose: bool,

    /// Summary format printed after a successful run
    #[arg(long, value_enum, default_value = "text")]
    format: OutputFormat,

    /// Directory holding the staged bundle or its tarball
    #[arg(long, default_value = DEFAULT_STAGING_DIR)]
    staging_dir: PathBuf,

    /// Directory the live bundle is installed into
    #[arg(long, default_value = DEFAULT_INSTALL_DIR)]
    install_dir: PathBuf,

    /// Append-only audit log
    #[arg(long, default_value = DEFAULT_LOG_PATH)]
    log_file: PathBuf,

    /// Preboot copy of the banner checked on macOS 13 and earlier
    #[arg(long, default_value = DEFAULT_PREBOOT_MARKER)]
    preboot_marker: PathBuf,

    /// Give up on the preboot sync after this many seconds (default: wait)
    #[arg(long)]
    sync_timeout: Option<u64>,
}

impl Cli {
    fn to_config(&self) -> DeployConfig {
        DeployConfig::default()
            .with_staging_dir(&self.staging_dir)
            .with_install_dir(&self.install_dir)
            .with_log_path(&self.log_file)
            .with_preboot_marker(&self.preboot_marker)
            .with_sync_timeout(self.sync_timeout.map(Duration::from_secs))
            .with_verbose(self.verbose)
    }
}

/// SIGINT, SIGTERM and SIGHUP, registered before any work starts.
struct TerminationSignals {
    interrupt: Signal,
    terminate: Signal,
    hangup: Signal,
}

impl TerminationSignals {
    fn register() -> std::io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            hangup: signal(SignalKind::hangup())?,
        })
    }

    /// Wait for the first termination signal and return its number.
    async fn recv(&mut self) -> i32 {
        tokio::select! {
            _ = self.interrupt.recv() => SIGINT,
            _ = self.terminate.recv() => SIGTERM,
            _ = self.hangup.recv() => SIGHUP,
        }
    }
}

/// Whichever of the run and a termination signal finished first.
enum Finished<T> {
    Run(T),
    Signal(i32),
}

async fn wait_for_signal(signals: Option<TerminationSignals>) -> i32 {
    match signals {
        Some(mut signals) => signals.recv().await,
        None => std::future::pending().await,
    }
}

fn print_report(report: &DeploymentReport, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(report)?),
        OutputFormat::Text => {
            println!("Decision: {:?}", report.decision);
            if let Some(ref install) = report.install {
                println!("Installed: {}", install.installed_path.display());
                println!("Files: {}", install.files_installed);
                if let Some(ref backup) = install.backup {
                    println!("Backup (discarded with workspace): {}", backup.display());
                }
            }
            println!("Preboot verification: {:?}", report.verification.outcome);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = cli.to_config();

    logger::init(&config.log_path, config.verbose);

    let orchestrator = Arc::new(Orchestrator::new(config, SystemHost::new()));
    let cleanup: CleanupHook = orchestrator.cleanup_hook();

    let signals = match TerminationSignals::register() {
        Ok(signals) => Some(signals),
        Err(e) => {
            warn!("Failed to register termination signal handlers: {}", e);
            None
        }
    };

    let mut run = tokio::spawn({
        let orchestrator = Arc::clone(&orchestrator);
        async move { orchestrator.run().await }
    });

    let finished = tokio::select! {
        joined = &mut run => Finished::Run(joined),
        signo = wait_for_signal(signals) => Finished::Signal(signo),
    };

    let code = match finished {
        Finished::Run(Ok(Ok(report))) => {
            if let Err(e) = print_report(&report, cli.format) {
                warn!("Failed to print summary: {}", e);
            }
            0
        }
        // Already logged by the orchestrator.
        Finished::Run(Ok(Err(e))) => e.exit_code(),
        Finished::Run(Err(e)) => {
            error!("Deployment task failed: {}", e);
            cleanup.release();
            1
        }
        Finished::Signal(signo) => terminate(signo, &cleanup, run, SHUTDOWN_GRACE).await,
    };

    std::process::exit(code);
}
