//! Error types for vmio
//!
//! This module defines the common error type used by backends, the
//! transfer engine, and the daemon handlers.

use thiserror::Error;

/// Common result type for vmio operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for vmio
#[derive(Debug, Error)]
pub enum Error {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("requested {requested} bytes, available {available} bytes")]
    PartialContent { requested: u64, available: u64 },

    // Request errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("you are not allowed to access this resource: {0}")]
    Forbidden(String),

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("operation not supported: {0}")]
    UnsupportedOperation(String),

    #[error("cannot satisfy range: {0}")]
    RangeNotSatisfiable(String),

    // Ticket errors
    #[error("timeout cancelling transfer {0}")]
    CancelTimeout(String),

    // Remote peer errors
    #[error("server error: [{code}] {message}")]
    Remote { code: u16, message: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an unsupported operation error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::UnsupportedOperation(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Get the HTTP status code used when surfacing this error to a
    /// data-plane client.
    #[must_use]
    pub fn http_status_code(&self) -> u16 {
        match self {
            // 400 Bad Request
            Self::InvalidArgument(_) | Self::PartialContent { .. } => 400,

            // 403 Forbidden
            Self::Forbidden(_) => 403,

            // 404 Not Found
            Self::NotFound(_) | Self::UnsupportedOperation(_) => 404,

            // 409 Conflict
            Self::CancelTimeout(_) => 409,

            // 416 Requested Range Not Satisfiable
            Self::RangeNotSatisfiable(_) => 416,

            // 500 Internal Server Error
            Self::Io(_) | Self::Protocol(_) | Self::Internal(_) => 500,

            // Pass the remote status through.
            Self::Remote { code, .. } => *code,
        }
    }

    /// True if the error must close the connection to stop further
    /// requests cheaply.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Forbidden(_) | Self::Protocol(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status() {
        assert_eq!(Error::Forbidden("no".into()).http_status_code(), 403);
        assert_eq!(
            Error::PartialContent {
                requested: 10,
                available: 5
            }
            .http_status_code(),
            400
        );
        assert_eq!(Error::unsupported("dirty").http_status_code(), 404);
        assert_eq!(Error::CancelTimeout("t1".into()).http_status_code(), 409);
        assert_eq!(Error::internal("boom").http_status_code(), 500);
    }

    #[test]
    fn test_fatal() {
        assert!(Error::Forbidden("no".into()).is_fatal());
        assert!(!Error::invalid_argument("bad").is_fatal());
    }
}
