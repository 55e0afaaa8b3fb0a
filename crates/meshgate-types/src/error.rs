use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable error class carried in the `code` field of an error
/// response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Validation,
    Timeout,
    Hardware,
    Unavailable,
}

/// Gateway-wide error type spanning request validation, radio faults and
/// the plumbing between connection handlers and the device worker.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("operation timed out after {after_ms} ms")]
    Timeout { after_ms: u64 },

    #[error("hardware fault during {operation}: {details}")]
    Hardware { operation: String, details: String },

    #[error("device worker is not running")]
    Unavailable,

    #[error("radio startup failed: {0}")]
    Startup(String),
}

impl GatewayError {
    /// Shorthand for [`GatewayError::Hardware`].
    pub fn hardware(operation: impl Into<String>, details: impl Into<String>) -> Self {
        Self::Hardware {
            operation: operation.into(),
            details: details.into(),
        }
    }

    pub fn timeout(after: std::time::Duration) -> Self {
        Self::Timeout {
            after_ms: u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Wire code reported to clients for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            GatewayError::Validation(_) => ErrorCode::Validation,
            GatewayError::Timeout { .. } => ErrorCode::Timeout,
            GatewayError::Hardware { .. } => ErrorCode::Hardware,
            GatewayError::Unavailable | GatewayError::Startup(_) => ErrorCode::Unavailable,
        }
    }
}
