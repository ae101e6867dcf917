//! Daemon error types

use convoy_autoscale::AutoscaleError;
use convoy_deployment::DeploymentError;
use convoy_platform::PlatformError;
use convoy_scheduler::ScheduleError;
use thiserror::Error;

/// Daemon errors
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Platform seed error: {0}")]
    Seed(#[from] PlatformError),

    #[error(transparent)]
    Deployment(#[from] DeploymentError),

    #[error(transparent)]
    Autoscale(#[from] AutoscaleError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl From<config::ConfigError> for DaemonError {
    fn from(e: config::ConfigError) -> Self {
        DaemonError::Config(e.to_string())
    }
}

/// Result type for daemon operations
pub type DaemonResult<T> = std::result::Result<T, DaemonError>;
