//! Termination-signal handling for an in-flight deployment.

use crate::workspace::CleanupHook;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// How long a signalled run gets to reach its next step boundary.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Stop a deployment after a termination signal and return the exit code
/// (`128 + signo`).
///
/// The hook is released first, so no new workspace can be created and the
/// run stops at its next workspace step. The run then gets `grace` to wind
/// down before the hook is released again to sweep anything a step already
/// in progress wrote. Install steps that completed are not undone.
pub async fn terminate<F>(signo: i32, cleanup: &CleanupHook, run: F, grace: Duration) -> i32
where
    F: Future,
{
    warn!(
        "Received signal {}; removing workspace {} and exiting. Install steps in progress are not undone.",
        signo,
        cleanup.path().display()
    );
    cleanup.release();

    match tokio::time::timeout(grace, run).await {
        Ok(_) => debug!("Deployment stopped after signal {}", signo),
        Err(_) => warn!(
            "Deployment still running {}s after signal {}; exiting anyway",
            grace.as_secs(),
            signo
        ),
    }
    cleanup.release();

    128 + signo
}
