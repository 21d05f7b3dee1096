//! Error types for encoding and decoding frames.

use std::io;

/// Alias for `Result<T, rtmessage_proto::Error>`.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced by the codec and the frame reader.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A message could not be encoded because one of its fields is out of range.
    #[error("invalid message: {field} {reason}")]
    InvalidMessage {
        /// Name of the offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },

    /// Bytes received from the wire do not form a valid frame.
    #[error("invalid frame: {0}")]
    InvalidFrame(#[from] FrameError),

    /// The underlying stream failed while reading a frame.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Shorthand for [`Error::InvalidMessage`].
    pub(crate) fn invalid_message(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidMessage {
            field,
            reason: reason.into(),
        }
    }
}

/// Ways a frame can fail validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum FrameError {
    /// The leading marker is not `0xAAAA`.
    #[error("invalid preamble marker 0x{0:04x}")]
    InvalidPreamble(u16),

    /// The version field names a protocol revision we do not speak.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u16),

    /// The trailing marker is not `0xAAAA`.
    #[error("invalid postamble marker 0x{0:04x}")]
    InvalidPostamble(u16),

    /// The declared payload length disagrees with the bytes that follow the header.
    #[error("payload length mismatch: header declares {declared} bytes, found {actual}")]
    PayloadLengthMismatch {
        /// Value of the `payload_length` field.
        declared: u32,
        /// Bytes actually present after the header.
        actual: usize,
    },

    /// The buffer ended before a field could be read.
    #[error("truncated frame: {field} needs {needed} bytes, {remaining} left")]
    TruncatedFrame {
        /// Field being read when the buffer ran out.
        field: &'static str,
        /// Bytes the field requires.
        needed: usize,
        /// Bytes that were left.
        remaining: usize,
    },

    /// The declared header length matches neither layout implied by the topics.
    #[error("unknown header layout: declared length {declared}, expected {without_timestamps} or {with_timestamps}")]
    UnknownHeaderLayout {
        /// Value of the `header_length` field.
        declared: u16,
        /// Length of a header without the timestamp block.
        without_timestamps: usize,
        /// Length of a header with the timestamp block.
        with_timestamps: usize,
    },

    /// A topic field is not valid UTF-8.
    #[error("{0} is not valid UTF-8")]
    InvalidUtf8(&'static str),
}
