//! Scheduler error types

use convoy_types::ScheduleEntryId;
use thiserror::Error;

/// Scheduler errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScheduleError {
    #[error("Invalid schedule expression '{expression}': {reason}")]
    InvalidExpression { expression: String, reason: String },

    #[error("Schedule entry not found: {0}")]
    EntryNotFound(ScheduleEntryId),

    #[error("Dispatch failed: {0}")]
    Dispatch(String),
}

impl ScheduleError {
    pub(crate) fn invalid(expression: &str, reason: impl Into<String>) -> Self {
        ScheduleError::InvalidExpression {
            expression: expression.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type for scheduler operations
pub type Result<T> = std::result::Result<T, ScheduleError>;
