//! Error types for connection operations.

use std::io;

use rtmessage_proto::FrameError;

/// Alias for `Result<T, rtmessage::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by [`Connection`](crate::Connection) operations and
/// reported to read-error listeners.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A URL, application name, topic, or payload was rejected.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A router URL named a transport other than `unix` or `tcp`.
    #[error("unsupported URL scheme '{0}'")]
    UnsupportedScheme(String),

    /// Bytes received from the router do not form a valid frame.
    #[error("invalid frame: {0}")]
    InvalidFrame(#[from] FrameError),

    /// The operation needs a state the connection is not in.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// A configured timeout elapsed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The socket failed.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
}

impl From<rtmessage_proto::Error> for Error {
    fn from(e: rtmessage_proto::Error) -> Self {
        match e {
            rtmessage_proto::Error::InvalidMessage { field, reason } => {
                Self::InvalidInput(format!("{field} {reason}"))
            }
            rtmessage_proto::Error::InvalidFrame(f) => Self::InvalidFrame(f),
            rtmessage_proto::Error::Io(io) if io.kind() == io::ErrorKind::TimedOut => {
                Self::DeadlineExceeded
            }
            rtmessage_proto::Error::Io(io) => Self::Transport(io),
            other => Self::Transport(io::Error::other(other)),
        }
    }
}
