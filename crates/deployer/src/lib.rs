//! PolicyBanner deployer - replaces the macOS login-window policy banner
//! bundle and confirms the FileVault preboot volume picked it up.

pub mod config;
pub mod host;
pub mod installer;
pub mod logger;
pub mod orchestrator;
pub mod preboot;
pub mod shutdown;
pub mod staging;
pub mod validator;
pub mod workspace;

pub use config::DeployConfig;
pub use orchestrator::{DeploymentReport, Orchestrator};
