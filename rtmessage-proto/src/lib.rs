//! Wire protocol for the rtmessage bus.
//!
//! A frame is a self-describing header bounded by two `0xAAAA` markers,
//! followed by an opaque payload. All integers are big-endian:
//!
//! ```text
//! marker(u16) version(u16) header_length(u16)
//! sequence_number(u32) flags(u32) control_data(u32) payload_length(u32)
//! topic_length(u32) topic  reply_topic_length(u32) reply_topic
//! [timestamp(u32) x 5]
//! marker(u16)
//! payload
//! ```
//!
//! [`encode`] and [`decode`] work on whole in-memory frames. [`FrameReader`]
//! pulls frames off any [`tokio::io::AsyncRead`] stream, tolerating short
//! and coalesced reads.

mod codec;
mod error;
mod flags;
mod message;
mod reader;

pub use codec::{decode, encode, encode_into};
pub use error::{Error, FrameError, Result};
pub use flags::Flags;
pub use message::{
    HEADER_LEN_MIN, HEADER_LEN_WITH_TIMESTAMPS, Header, MARKER, MAX_TOPIC_LEN, Message,
    PREAMBLE_LEN, Preamble, TIMESTAMP_COUNT, VERSION,
};
pub use reader::FrameReader;
