//! Autoscaling error types

use convoy_platform::PlatformError;
use convoy_types::{ScalingPolicyError, ServiceKey};
use thiserror::Error;

/// Autoscaling errors
#[derive(Debug, Error)]
pub enum AutoscaleError {
    #[error("Invalid scaling policy: {0}")]
    InvalidPolicy(#[from] ScalingPolicyError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("No scaling policy registered for {0}")]
    NotRegistered(ServiceKey),
}

/// Result type for autoscaling operations
pub type Result<T> = std::result::Result<T, AutoscaleError>;
