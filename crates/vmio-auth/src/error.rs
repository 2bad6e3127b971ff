//! Authorization error types

use thiserror::Error;

/// Errors from ticket validation and authorization
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("required ticket parameter is missing: {0}")]
    MissingParameter(&'static str),

    #[error("invalid value for {parameter:?}: {reason}")]
    InvalidParameter {
        parameter: &'static str,
        reason: String,
    },

    #[error("no such ticket: {0}")]
    NoSuchTicket(String),

    #[error("you are not allowed to access this resource: {0}")]
    Forbidden(String),

    #[error("timeout cancelling transfer {0}")]
    CancelTimeout(String),
}

impl AuthError {
    pub(crate) fn invalid(parameter: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            parameter,
            reason: reason.into(),
        }
    }
}

impl From<AuthError> for vmio_common::Error {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::MissingParameter(_) | AuthError::InvalidParameter { .. } => {
                Self::InvalidArgument(err.to_string())
            }
            AuthError::NoSuchTicket(id) => Self::NotFound(format!("no such ticket: {id}")),
            AuthError::Forbidden(reason) => Self::Forbidden(reason),
            AuthError::CancelTimeout(id) => Self::CancelTimeout(id),
        }
    }
}
