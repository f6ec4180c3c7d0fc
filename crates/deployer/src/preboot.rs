//! FileVault preboot volume resynchronisation and verification.
//!
//! `diskutil apfs updatePreboot` prints free-form text with no timestamps
//! and no stable success wording, so verification is best effort: the run
//! window is logged around the captured output, the output is classified
//! by an ordered marker table, and on releases before macOS 14 the preboot
//! copy of the banner is checked on disk. Nothing here fails the run.

use crate::config::{DeployConfig, MARKER_UNRELIABLE_FROM_MAJOR};
use crate::host::Host;
use crate::logger;
use policybanner_common::{OsVersion, Timestamp};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Coarse reading of the sync command's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncClassification {
    Succeeded,
    IssuesDetected,
    StandardOutput,
}

/// Maps a marker phrase found in the output to a classification.
#[derive(Debug, Clone, Copy)]
pub struct ClassificationRule {
    pub marker: &'static str,
    pub classification: SyncClassification,
}

/// Checked in order; the first rule whose marker occurs wins. The success
/// marker itself contains "error", so it must come first.
pub const CLASSIFICATION_RULES: &[ClassificationRule] = &[
    ClassificationRule {
        marker: "overall error=(ZERO)",
        classification: SyncClassification::Succeeded,
    },
    ClassificationRule {
        marker: "error",
        classification: SyncClassification::IssuesDetected,
    },
];

/// Classify captured output against [`CLASSIFICATION_RULES`].
pub fn classify(output: &str) -> SyncClassification {
    CLASSIFICATION_RULES
        .iter()
        .find(|rule| output.contains(rule.marker))
        .map(|rule| rule.classification)
        .unwrap_or(SyncClassification::StandardOutput)
}

/// How the sync command itself ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncStatus {
    Completed,
    Failed { exit_code: Option<i32> },
    TimedOut { after_secs: u64 },
    LaunchFailed { reason: String },
}

/// Result of the preboot marker check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "marker", rename_all = "snake_case")]
pub enum MarkerCheck {
    Present,
    Missing,
    /// Unreliable on this release, not checked.
    Skipped { major: u32 },
    /// The sync failed, so no further checks ran.
    NotChecked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationOutcome {
    Success,
    Degraded,
    Unverifiable,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    pub outcome: VerificationOutcome,
    pub sync: SyncStatus,
    pub classification: Option<SyncClassification>,
    pub marker: MarkerCheck,
    pub os_version: Option<OsVersion>,
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
}

impl VerificationReport {
    fn outcome_for(
        sync: &SyncStatus,
        classification: Option<SyncClassification>,
        marker: &MarkerCheck,
    ) -> VerificationOutcome {
        if *sync != SyncStatus::Completed {
            return VerificationOutcome::Unverifiable;
        }
        if classification == Some(SyncClassification::IssuesDetected)
            || *marker == MarkerCheck::Missing
        {
            return VerificationOutcome::Degraded;
        }
        VerificationOutcome::Success
    }
}

/// Runs the preboot sync and its follow-up checks.
pub struct PrebootVerifier<'a, H: Host + ?Sized> {
    config: &'a DeployConfig,
    host: &'a H,
}

impl<'a, H: Host + ?Sized> PrebootVerifier<'a, H> {
    pub fn new(config: &'a DeployConfig, host: &'a H) -> Self {
        Self { config, host }
    }

    pub async fn verify(&self) -> VerificationReport {
        let command = &self.config.sync_command;
        let capture = self.config.capture_path();
        let started_at = Timestamp::now();

        info!("Updating preboot volume: {}", command.display());
        let sync = self.run_sync().await;
        let finished_at = Timestamp::now();

        if sync != SyncStatus::Completed {
            warn!(
                "Preboot volume update failed ({}); the login window may show the previous banner until the next sync",
                describe(&sync)
            );
            info!("Preboot update started: {}", started_at);
            info!("Preboot update failed at: {}", finished_at);
            let _ = self.append_capture(&capture);

            return VerificationReport {
                outcome: VerificationOutcome::Unverifiable,
                sync,
                classification: None,
                marker: MarkerCheck::NotChecked,
                os_version: None,
                started_at,
                finished_at,
            };
        }

        info!("Preboot update started: {}", started_at);
        info!(
            "Preboot update finished: {} ({}s)",
            finished_at,
            started_at.until(&finished_at).num_seconds()
        );
        let output = self.append_capture(&capture);

        let classification = classify(&output);
        match classification {
            SyncClassification::Succeeded => {
                info!("Preboot volume update completed successfully")
            }
            SyncClassification::IssuesDetected => warn!(
                "Preboot volume update completed, but its output potentially reports issues"
            ),
            SyncClassification::StandardOutput => {
                info!("Preboot volume update completed with standard output")
            }
        }

        let os_version = self.os_version().await;
        let marker = self.check_marker(os_version);

        VerificationReport {
            outcome: VerificationReport::outcome_for(&sync, Some(classification), &marker),
            sync,
            classification: Some(classification),
            marker,
            os_version,
            started_at,
            finished_at,
        }
    }

    async fn run_sync(&self) -> SyncStatus {
        let command = &self.config.sync_command;
        let capture = self.config.capture_path();
        let run = self.host.run_captured(command, &capture);

        let result = match self.config.sync_timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(result) => result,
                Err(_) => {
                    return SyncStatus::TimedOut {
                        after_secs: limit.as_secs(),
                    }
                }
            },
            None => run.await,
        };

        match result {
            Ok(Some(0)) => SyncStatus::Completed,
            Ok(exit_code) => SyncStatus::Failed { exit_code },
            Err(e) => SyncStatus::LaunchFailed {
                reason: e.to_string(),
            },
        }
    }

    /// Copy the captured output verbatim into the audit log and return it.
    fn append_capture(&self, capture: &std::path::Path) -> String {
        let bytes = match std::fs::read(capture) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("No captured output at {}: {}", capture.display(), e);
                return String::new();
            }
        };

        info!(
            "Output of {} ({} bytes):",
            self.config.sync_command.display(),
            bytes.len()
        );
        if let Err(e) = logger::append_raw(&self.config.log_path, &bytes) {
            warn!(
                "Failed to append captured output to {}: {}",
                self.config.log_path.display(),
                e
            );
        }

        String::from_utf8_lossy(&bytes).into_owned()
    }

    async fn os_version(&self) -> Option<OsVersion> {
        let raw = match self.host.query(&self.config.version_command).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Could not determine macOS version: {}", e);
                return None;
            }
        };

        match raw.parse::<OsVersion>() {
            Ok(version) => {
                debug!("Detected macOS {}", version);
                Some(version)
            }
            Err(e) => {
                warn!("Could not determine macOS version: {}", e);
                None
            }
        }
    }

    fn check_marker(&self, os_version: Option<OsVersion>) -> MarkerCheck {
        if let Some(version) = os_version {
            if version.is_at_least(MARKER_UNRELIABLE_FROM_MAJOR) {
                info!(
                    "Skipping preboot PolicyBanner check on macOS {} (unreliable on {} and later)",
                    version, MARKER_UNRELIABLE_FROM_MAJOR
                );
                return MarkerCheck::Skipped {
                    major: version.major,
                };
            }
        }

        let marker = &self.config.preboot_marker;
        if marker.exists() {
            info!(
                "Preboot PolicyBanner configured correctly ({})",
                marker.display()
            );
            MarkerCheck::Present
        } else {
            warn!(
                "Preboot PolicyBanner not configured: {} is missing",
                marker.display()
            );
            MarkerCheck::Missing
        }
    }
}

fn describe(sync: &SyncStatus) -> String {
    match sync {
        SyncStatus::Completed => "completed".to_string(),
        SyncStatus::Failed {
            exit_code: Some(code),
        } => format!("exit status {}", code),
        SyncStatus::Failed { exit_code: None } => "terminated by signal".to_string(),
        SyncStatus::TimedOut { after_secs } => format!("timed out after {}s", after_secs),
        SyncStatus::LaunchFailed { reason } => reason.clone(),
    }
}
