//! Deployment error types

use convoy_platform::PlatformError;
use convoy_types::{DeploymentId, ScalingPolicyError, ServiceKey, TaskSpecError};
use std::time::Duration;
use thiserror::Error;

/// Deployment errors
#[derive(Debug, Clone, Error)]
pub enum DeploymentError {
    #[error("Invalid spec: {0}")]
    InvalidSpec(String),

    #[error("Missing required field: {0}")]
    MissingRequiredField(String),

    #[error("Conflicting deployment on {service}: {reason}")]
    ConflictingDeployment { service: ServiceKey, reason: String },

    #[error("Transient platform error during {operation}: {message}")]
    PlatformTransient { operation: String, message: String },

    #[error("Platform rejected {operation}: {message}")]
    PlatformPermanent { operation: String, message: String },

    #[error("Timeout after {after:?} waiting for {operation}")]
    Timeout { operation: String, after: Duration },

    #[error("Approval expired after {0:?}")]
    ApprovalExpired(Duration),

    #[error("Approval rejected by {approver}: {reason}")]
    ApprovalRejected { approver: String, reason: String },

    #[error("Deployment cancelled")]
    Cancelled,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Deployment not found: {0}")]
    DeploymentNotFound(DeploymentId),

    #[error("Platform circuit breaker rolled back {service}")]
    CircuitBreakerTripped { service: ServiceKey },

    #[error("Task run {job} failed: {reason}")]
    TaskRunFailed { job: String, reason: String },

    #[error("State store error: {0}")]
    StateStore(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeploymentError {
    /// Short, stable name of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            DeploymentError::InvalidSpec(_) => "invalid_spec",
            DeploymentError::MissingRequiredField(_) => "missing_required_field",
            DeploymentError::ConflictingDeployment { .. } => "conflicting_deployment",
            DeploymentError::PlatformTransient { .. } => "platform_transient",
            DeploymentError::PlatformPermanent { .. } => "platform_permanent",
            DeploymentError::Timeout { .. } => "timeout",
            DeploymentError::ApprovalExpired(_) => "approval_expired",
            DeploymentError::ApprovalRejected { .. } => "approval_rejected",
            DeploymentError::Cancelled => "cancelled",
            DeploymentError::NotFound(_) | DeploymentError::DeploymentNotFound(_) => "not_found",
            DeploymentError::CircuitBreakerTripped { .. } => "circuit_breaker",
            DeploymentError::TaskRunFailed { .. } => "task_run_failed",
            DeploymentError::StateStore(_) => "state_store",
            DeploymentError::Internal(_) => "internal",
        }
    }

    pub fn conflict(service: &ServiceKey, reason: impl Into<String>) -> Self {
        DeploymentError::ConflictingDeployment {
            service: service.clone(),
            reason: reason.into(),
        }
    }
}

impl From<PlatformError> for DeploymentError {
    fn from(error: PlatformError) -> Self {
        match error {
            PlatformError::Transient { operation, message } => {
                DeploymentError::PlatformTransient { operation, message }
            }
            PlatformError::Permanent { operation, message } => {
                DeploymentError::PlatformPermanent { operation, message }
            }
            PlatformError::NotFound { kind, name } => {
                DeploymentError::NotFound(format!("{} {}", kind, name))
            }
        }
    }
}

impl From<TaskSpecError> for DeploymentError {
    fn from(error: TaskSpecError) -> Self {
        DeploymentError::InvalidSpec(error.to_string())
    }
}

impl From<ScalingPolicyError> for DeploymentError {
    fn from(error: ScalingPolicyError) -> Self {
        DeploymentError::InvalidSpec(error.to_string())
    }
}

impl From<crate::state::StateStoreError> for DeploymentError {
    fn from(error: crate::state::StateStoreError) -> Self {
        DeploymentError::StateStore(error.to_string())
    }
}

/// Result type for deployment operations
pub type Result<T> = std::result::Result<T, DeploymentError>;
