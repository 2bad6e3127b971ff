//! NBD client error types

use thiserror::Error;

use crate::proto;

/// Result type for NBD operations
pub type Result<T> = std::result::Result<T, Error>;

/// NBD client error
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Server sent an invalid response. The connection must be closed.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Server refused an option.
    #[error("error negotiating option {option} code={code}: {reason}")]
    Option {
        option: u32,
        code: u32,
        reason: String,
    },

    /// Server does not know the option; the client can continue without
    /// the associated feature.
    #[error("option {option} is not supported: {reason}")]
    OptionUnsupported { option: u32, reason: String },

    /// Server failed a single request. The connection remains usable.
    #[error("{message}: [error {code}] {}", proto::strerror(*.code))]
    Reply { code: u32, message: String },

    /// The requested operation is not supported on this connection.
    #[error("unsupported request: {0}")]
    UnsupportedRequest(String),

    /// Structured reply chunks reported partial errors; the request
    /// failed as a whole.
    #[error("errors receiving reply: {0:?}")]
    Request(Vec<(u64, String)>),

    #[error("unsupported URL: {0}")]
    InvalidUrl(String),

    /// A qemu child process failed or misbehaved.
    #[error("qemu error: {0}")]
    Qemu(String),
}

impl Error {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub(crate) fn reply(code: u32, message: impl Into<String>) -> Self {
        let mut message = message.into();
        if message.is_empty() {
            // Message is optional, but qemu-nbd always sends one.
            message = "server error".to_string();
        }
        Self::Reply { code, message }
    }

    /// The POSIX errno carried by a reply error, if any.
    #[must_use]
    pub fn reply_errno(&self) -> Option<i32> {
        match self {
            Self::Reply { code, .. } => Some(proto::reply_errno(*code)),
            _ => None,
        }
    }
}

impl From<Error> for vmio_common::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(e) => Self::Io(e),
            Error::Reply { .. } => {
                let errno = err.reply_errno().unwrap_or(libc::EIO);
                Self::Io(std::io::Error::from_raw_os_error(errno))
            }
            Error::UnsupportedRequest(reason) => Self::UnsupportedOperation(reason),
            other => Self::Protocol(other.to_string()),
        }
    }
}
