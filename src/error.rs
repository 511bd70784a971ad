//! Bridge-level error taxonomy.
//!
//! Only request validation surfaces synchronously to callers; everything
//! that happens after a request is accepted is reported through
//! [`DownloadEvent::Failed`](crate::events::DownloadEvent) instead of a
//! returned error.

use thiserror::Error;

use crate::service::ServiceError;
use crate::store::StoreError;

/// Result type for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors surfaced by the download bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// A required request field is missing or malformed. Rejected
    /// synchronously; never reaches the registry.
    #[error("invalid request parameters: {0}")]
    Parameter(String),

    /// The download service reported a failure.
    #[error("transfer failed (code {code}): {reason}")]
    Transfer {
        /// Numeric failure code (see [`FailureCode`](crate::service::FailureCode)).
        code: i64,
        /// Human-readable failure reason.
        reason: String,
    },

    /// Moving the completed file to its destination failed.
    #[error("filesystem error: {0}")]
    FileSystem(#[from] std::io::Error),

    /// Persisted-state read or write failed. Logged and treated as
    /// empty/default state; never fatal to the running process.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The durable store rejected an operation.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The download service rejected an operation.
    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl BridgeError {
    /// Creates a `Parameter` error naming the offending field.
    #[must_use]
    pub fn missing_field(field: &str) -> Self {
        Self::Parameter(format!("{field} must be set"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parameter_error_message() {
        let err = BridgeError::missing_field("taskId");
        let msg = err.to_string();
        assert!(msg.contains("invalid request parameters"));
        assert!(msg.contains("taskId"));
    }

    #[test]
    fn test_transfer_error_message_carries_code_and_reason() {
        let err = BridgeError::Transfer {
            code: 1008,
            reason: "cannot resume".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("1008"));
        assert!(msg.contains("cannot resume"));
    }

    #[test]
    fn test_filesystem_error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = BridgeError::from(io);
        assert!(err.to_string().contains("denied"));
    }
}
