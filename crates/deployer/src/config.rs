//! Deployment configuration.
//!
//! A single [`DeployConfig`] is built at process start and handed by
//! reference to every component. Nothing reads paths from globals.

use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_STAGING_DIR: &str = "/private/tmp/policybanner";
pub const DEFAULT_BUNDLE_NAME: &str = "PolicyBanner.rtfd";
pub const DEFAULT_ARCHIVE_NAME: &str = "PolicyBanner.rtfd.tar.gz";
pub const DEFAULT_WORKSPACE_NAME: &str = "workspace";
pub const DEFAULT_INSTALL_DIR: &str = "/Library/Security";
pub const DEFAULT_LOG_PATH: &str = "/var/log/policybanner.log";
pub const DEFAULT_PREBOOT_MARKER: &str =
    "/System/Volumes/Preboot/Library/Security/PolicyBanner.rtfd";
pub const DEFAULT_OWNER_USER: &str = "root";
pub const DEFAULT_OWNER_GROUP: &str = "wheel";
pub const DEFAULT_BUNDLE_MODE: u32 = 0o755;

/// First macOS major release on which the preboot marker is unreliable.
pub const MARKER_UNRELIABLE_FROM_MAJOR: u32 = 14;

/// Name of the scratch file receiving the sync command's output.
pub const CAPTURE_FILE_NAME: &str = "preboot_sync.out";

/// An external program and its fixed arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Render as a shell-like string for logs and errors.
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// Immutable configuration for one deployment run.
#[derive(Debug, Clone)]
pub struct DeployConfig {
    pub staging_dir: PathBuf,
    pub bundle_name: String,
    pub archive_name: String,
    pub workspace_dir: PathBuf,
    pub install_dir: PathBuf,
    pub log_path: PathBuf,
    pub preboot_marker: PathBuf,
    pub owner_user: String,
    pub owner_group: String,
    pub bundle_mode: u32,
    pub sync_command: CommandSpec,
    pub version_command: CommandSpec,
    /// `None` waits for the sync command indefinitely.
    pub sync_timeout: Option<Duration>,
    pub verbose: bool,
}

impl Default for DeployConfig {
    fn default() -> Self {
        let staging_dir = PathBuf::from(DEFAULT_STAGING_DIR);
        Self {
            workspace_dir: staging_dir.join(DEFAULT_WORKSPACE_NAME),
            staging_dir,
            bundle_name: DEFAULT_BUNDLE_NAME.to_string(),
            archive_name: DEFAULT_ARCHIVE_NAME.to_string(),
            install_dir: PathBuf::from(DEFAULT_INSTALL_DIR),
            log_path: PathBuf::from(DEFAULT_LOG_PATH),
            preboot_marker: PathBuf::from(DEFAULT_PREBOOT_MARKER),
            owner_user: DEFAULT_OWNER_USER.to_string(),
            owner_group: DEFAULT_OWNER_GROUP.to_string(),
            bundle_mode: DEFAULT_BUNDLE_MODE,
            sync_command: CommandSpec::new("diskutil", &["apfs", "updatePreboot", "/"]),
            version_command: CommandSpec::new("sw_vers", &["-productVersion"]),
            sync_timeout: None,
            verbose: false,
        }
    }
}

impl DeployConfig {
    /// Point the staging area elsewhere. The workspace moves with it.
    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = dir.into();
        self.workspace_dir = self.staging_dir.join(DEFAULT_WORKSPACE_NAME);
        self
    }

    pub fn with_install_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.install_dir = dir.into();
        self
    }

    pub fn with_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = path.into();
        self
    }

    pub fn with_preboot_marker(mut self, path: impl Into<PathBuf>) -> Self {
        self.preboot_marker = path.into();
        self
    }

    pub fn with_owner(mut self, user: &str, group: &str) -> Self {
        self.owner_user = user.to_string();
        self.owner_group = group.to_string();
        self
    }

    pub fn with_sync_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.sync_timeout = timeout;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Incoming bundle when staged as a plain directory.
    pub fn staged_bundle(&self) -> PathBuf {
        self.staging_dir.join(&self.bundle_name)
    }

    /// Incoming bundle when staged as a gzip tarball.
    pub fn staged_archive(&self) -> PathBuf {
        self.staging_dir.join(&self.archive_name)
    }

    /// Where the tarball is unpacked inside the workspace.
    pub fn extraction_dir(&self) -> PathBuf {
        self.workspace_dir.join("extracted")
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.workspace_dir.join("backups")
    }

    pub fn capture_path(&self) -> PathBuf {
        self.workspace_dir.join(CAPTURE_FILE_NAME)
    }

    /// The live bundle.
    pub fn installed_bundle(&self) -> PathBuf {
        self.install_dir.join(&self.bundle_name)
    }
}
