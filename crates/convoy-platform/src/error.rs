//! Platform error taxonomy

use thiserror::Error;

/// Errors returned by a platform client.
///
/// Only `Transient` errors are worth retrying; everything else reflects a
/// request the platform will keep rejecting.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    #[error("Transient platform error during {operation}: {message}")]
    Transient { operation: String, message: String },

    #[error("Platform rejected {operation}: {message}")]
    Permanent { operation: String, message: String },

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },
}

impl PlatformError {
    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Permanent {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, PlatformError::Transient { .. })
    }
}

/// Result type for platform operations
pub type Result<T> = std::result::Result<T, PlatformError>;
