//! Common error types for policybanner.

use std::path::PathBuf;
use thiserror::Error;

/// Coarse classification of an [`Error`], mirroring how the run reacts to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The run cannot start: missing privilege, missing or malformed source.
    Precondition,
    /// A filesystem mutation on the live bundle failed.
    Mutation,
    /// Preboot verification could not complete. Never fatal.
    Verification,
    /// Anything else.
    Other,
}

/// Common error type for policybanner operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Must be run as root (effective uid {uid})")]
    NotPrivileged { uid: u32 },

    #[error("Incoming bundle not found at {}", path.display())]
    MissingSource { path: PathBuf },

    #[error("Incoming bundle at {} is malformed: {reason}", path.display())]
    MalformedSource { path: PathBuf, reason: String },

    #[error("Failed to extract {}: {source}", archive.display())]
    Extraction {
        archive: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot prepare install directory {}: {source}", path.display())]
    InstallDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Workspace error at {}: {source}", path.display())]
    Workspace {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Backup of {} failed: {source}", path.display())]
    Backup {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Removal of {} failed: {source}", path.display())]
    Remove {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Install to {} failed: {source}", path.display())]
    Install {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Setting permissions on {} failed: {source}", path.display())]
    Permissions {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot resolve owner {user}:{group}: {reason}")]
    Ownership {
        user: String,
        group: String,
        reason: String,
    },

    #[error("Command execution failed: {cmd} - {reason}")]
    CommandExecution { cmd: String, reason: String },

    #[error("Invalid OS version: {0}")]
    InvalidVersion(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using common Error.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotPrivileged { .. }
            | Error::MissingSource { .. }
            | Error::MalformedSource { .. }
            | Error::Extraction { .. }
            | Error::InstallDir { .. }
            | Error::Workspace { .. } => ErrorKind::Precondition,
            Error::Backup { .. }
            | Error::Remove { .. }
            | Error::Install { .. }
            | Error::Permissions { .. }
            | Error::Ownership { .. } => ErrorKind::Mutation,
            Error::CommandExecution { .. } | Error::InvalidVersion(_) => ErrorKind::Verification,
            Error::Io(_) => ErrorKind::Other,
        }
    }

    /// Process exit code for a run that ended with this error.
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::Precondition => 2,
            ErrorKind::Mutation => 3,
            ErrorKind::Verification | ErrorKind::Other => 1,
        }
    }
}
