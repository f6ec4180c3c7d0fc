//! Access to the machine the deployment runs on.

use crate::config::CommandSpec;
use async_trait::async_trait;
use policybanner_common::{Error, Result};
use std::fs::File;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Trait for the host facilities the deployment depends on.
#[async_trait]
pub trait Host: Send + Sync {
    /// Effective user id of this process.
    fn effective_uid(&self) -> u32;

    /// Run a command and return its trimmed standard output.
    async fn query(&self, command: &CommandSpec) -> Result<String>;

    /// Run a command with stdout and stderr both redirected into
    /// `capture`. Returns the exit code, `None` if killed by a signal.
    async fn run_captured(&self, command: &CommandSpec, capture: &Path) -> Result<Option<i32>>;
}

fn execution_error(command: &CommandSpec, reason: impl ToString) -> Error {
    Error::CommandExecution {
        cmd: command.display(),
        reason: reason.to_string(),
    }
}

/// The real machine.
pub struct SystemHost;

impl SystemHost {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SystemHost {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Host for SystemHost {
    fn effective_uid(&self) -> u32 {
        nix::unistd::Uid::effective().as_raw()
    }

    async fn query(&self, command: &CommandSpec) -> Result<String> {
        debug!("Local exec: {}", command.display());

        let output = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| execution_error(command, e))?;

        if !output.status.success() {
            return Err(execution_error(
                command,
                format!(
                    "{}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn run_captured(&self, command: &CommandSpec, capture: &Path) -> Result<Option<i32>> {
        debug!(
            "Local exec: {} > {}",
            command.display(),
            capture.display()
        );

        let stdout = File::create(capture).map_err(|e| execution_error(command, e))?;
        let stderr = stdout.try_clone().map_err(|e| execution_error(command, e))?;

        // Dropping the future (timeout) must not leave the child running.
        let status = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| execution_error(command, e))?;

        Ok(status.code())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Scripted host for tests: writes canned output to the capture file
    /// and records every command it is asked to run.
    pub(crate) struct FakeHost {
        pub uid: u32,
        pub version: std::result::Result<String, String>,
        pub sync_output: String,
        pub sync_exit: Option<i32>,
        pub sync_delay: Option<Duration>,
        pub calls: Mutex<Vec<String>>,
    }

    impl FakeHost {
        pub(crate) fn root() -> Self {
            Self {
                uid: 0,
                version: Ok("14.4.1".to_string()),
                sync_output: "Started APFS operation\nExiting Update Preboot operation with overall error=(ZERO)\n"
                    .to_string(),
                sync_exit: Some(0),
                sync_delay: None,
                calls: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Host for FakeHost {
        fn effective_uid(&self) -> u32 {
            self.uid
        }

        async fn query(&self, command: &CommandSpec) -> Result<String> {
            self.calls.lock().unwrap().push(command.display());
            self.version
                .clone()
                .map_err(|reason| execution_error(command, reason))
        }

        async fn run_captured(&self, command: &CommandSpec, capture: &Path) -> Result<Option<i32>> {
            self.calls.lock().unwrap().push(command.display());
            std::fs::write(capture, &self.sync_output)?;
            if let Some(delay) = self.sync_delay {
                tokio::time::sleep(delay).await;
            }
            Ok(self.sync_exit)
        }
    }

    #[tokio::test]
    async fn test_system_host_captures_both_streams() {
        let dir = tempfile::tempdir().unwrap();
        let capture: PathBuf = dir.path().join("out.txt");
        let command = CommandSpec::new("sh", &["-c", "echo to-stdout; echo to-stderr >&2; exit 3"]);

        let code = SystemHost::new()
            .run_captured(&command, &capture)
            .await
            .unwrap();

        assert_eq!(code, Some(3));
        let captured = std::fs::read_to_string(&capture).unwrap();
        assert!(captured.contains("to-stdout"));
        assert!(captured.contains("to-stderr"));
    }

    #[tokio::test]
    async fn test_system_host_query_trims_output() {
        let command = CommandSpec::new("sh", &["-c", "printf '13.6.4\\n'"]);
        let version = SystemHost::new().query(&command).await.unwrap();
        assert_eq!(version, "13.6.4");
    }

    #[tokio::test]
    async fn test_system_host_missing_program() {
        let dir = tempfile::tempdir().unwrap();
        let command = CommandSpec::new("definitely-not-a-real-binary-pb", &[]);
        let err = SystemHost::new()
            .run_captured(&command, &dir.path().join("out.txt"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CommandExecution { .. }));
    }
}
