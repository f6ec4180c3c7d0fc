//! Ephemeral scratch workspace.
//!
//! The workspace directory holds extraction output, the backup snapshot and
//! the sync command's capture file. It must be gone on every exit path, so
//! removal goes through a [`CleanupHook`] that is created at process start
//! and shared with the termination-signal handler.
//!
//! Releasing a hook closes it: a closed hook refuses to create the workspace
//! again, and steps that write into a live workspace check
//! [`Workspace::ensure_open`] first. Every release sweeps the directory, so
//! a write that was already in flight when the hook closed is removed by the
//! next release.

use policybanner_common::{Error, Result};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

#[derive(Debug)]
struct HookState {
    path: PathBuf,
    /// Set once the hook is released. Creation and removal both hold it.
    released: Mutex<bool>,
}

/// Idempotent remover for the workspace directory. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CleanupHook {
    state: Arc<HookState>,
}

impl CleanupHook {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            state: Arc::new(HookState {
                path: path.into(),
                released: Mutex::new(false),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.state.path
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        // A panic while holding the lock leaves the flag itself valid.
        self.state
            .released
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_released(&self) -> bool {
        *self.lock()
    }

    /// Close the hook and remove the workspace directory. Safe to call any
    /// number of times; failures are logged at debug level and never
    /// propagated.
    pub fn release(&self) {
        let mut released = self.lock();
        *released = true;

        match remove_dir(&self.state.path) {
            Ok(true) => debug!("Removed workspace {}", self.state.path.display()),
            Ok(false) => debug!("Workspace {} already absent", self.state.path.display()),
            Err(e) => debug!(
                "Failed to remove workspace {}: {}",
                self.state.path.display(),
                e
            ),
        }
    }

    fn closed_error(&self) -> Error {
        Error::Workspace {
            path: self.state.path.clone(),
            source: io::Error::new(io::ErrorKind::Interrupted, "workspace released for shutdown"),
        }
    }
}

/// Remove a directory tree. `Ok(false)` if it did not exist.
fn remove_dir(path: &Path) -> io::Result<bool> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// A live workspace. Dropping it removes the directory.
#[derive(Debug)]
pub struct Workspace {
    hook: CleanupHook,
}

impl Workspace {
    /// Create a fresh workspace directory, discarding any stale copy left
    /// behind by a run that was killed without a chance to clean up.
    ///
    /// Fails with [`Error::Workspace`] once the hook has been released.
    pub fn create(hook: &CleanupHook) -> Result<Self> {
        let released = hook.lock();
        if *released {
            return Err(hook.closed_error());
        }

        let path = hook.path();
        let workspace_error = |source| Error::Workspace {
            path: path.to_path_buf(),
            source,
        };

        if remove_dir(path).map_err(workspace_error)? {
            debug!("Discarded stale workspace {}", path.display());
        }
        std::fs::create_dir_all(path).map_err(workspace_error)?;
        debug!("Created workspace {}", path.display());
        drop(released);

        Ok(Self { hook: hook.clone() })
    }

    pub fn path(&self) -> &Path {
        self.hook.path()
    }

    /// Fail with [`Error::Workspace`] if shutdown has released the hook.
    /// Called before each step that writes into the workspace.
    pub fn ensure_open(&self) -> Result<()> {
        if self.hook.is_released() {
            return Err(self.hook.closed_error());
        }
        Ok(())
    }

    /// Remove the workspace now rather than on drop.
    pub fn destroy(self) {
        self.hook.release();
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        self.hook.release();
    }
}
