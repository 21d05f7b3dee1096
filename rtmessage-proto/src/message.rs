//! Frame header and message types.

use crate::Flags;

/// Sentinel bounding both ends of the header.
pub const MARKER: u16 = 0xAAAA;

/// The only protocol version this crate encodes or accepts.
pub const VERSION: u16 = 2;

/// Maximum byte length of `topic` and `reply_topic`.
pub const MAX_TOPIC_LEN: usize = 128;

/// Bytes in the preamble: marker, version, header length.
pub const PREAMBLE_LEN: usize = 6;

/// Header length with empty topics and no timestamp block.
pub const HEADER_LEN_MIN: usize = 32;

/// Header length with empty topics and the timestamp block present.
pub const HEADER_LEN_WITH_TIMESTAMPS: usize = HEADER_LEN_MIN + TIMESTAMP_COUNT * 4;

/// Number of diagnostic timestamp slots.
pub const TIMESTAMP_COUNT: usize = 5;

/// The fixed-size prefix of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preamble {
    /// Protocol version (always [`VERSION`] once validated).
    pub version: u16,
    /// Total header bytes, leading marker through trailing marker.
    pub header_length: u16,
}

impl Preamble {
    /// Bytes of header that follow the preamble.
    pub const fn body_len(self) -> usize {
        self.header_length as usize - PREAMBLE_LEN
    }
}

/// A fully parsed header, without the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Version and declared header length.
    pub preamble: Preamble,
    /// Sender-assigned sequence number.
    pub sequence_number: u32,
    /// Flag bits.
    pub flags: Flags,
    /// Route id or application-defined value.
    pub control_data: u32,
    /// Bytes of payload following the header.
    pub payload_length: u32,
    /// Destination topic.
    pub topic: String,
    /// Topic replies should be sent to; empty when absent.
    pub reply_topic: String,
    /// Diagnostic timestamps; all zero when the block was absent.
    pub timestamps: [u32; TIMESTAMP_COUNT],
}

impl Header {
    /// Header length implied by the topic sizes and the presence of timestamps.
    pub const fn expected_len(topic_len: usize, reply_len: usize, timestamps: bool) -> usize {
        let base = if timestamps {
            HEADER_LEN_WITH_TIMESTAMPS
        } else {
            HEADER_LEN_MIN
        };
        base + topic_len + reply_len
    }
}

/// One message on the bus.
///
/// `version` and `header_length` are not stored: they are derived by
/// [`encode`](crate::encode) and checked by [`decode`](crate::decode).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    /// Sender-assigned sequence number. Responses echo the request's value.
    pub sequence_number: u32,
    /// Flag bits. REQUEST and RESPONSE are never set together.
    pub flags: Flags,
    /// Subscription route id or an application-defined value.
    pub control_data: u32,
    /// Destination topic (1..=128 bytes).
    pub topic: String,
    /// Where replies should go; empty for none (0..=128 bytes).
    pub reply_topic: String,
    /// Diagnostic timestamps. Omitted from the wire when all zero.
    pub timestamps: [u32; TIMESTAMP_COUNT],
    /// Opaque application data.
    pub payload: Vec<u8>,
}

impl Message {
    /// Creates a plain message for `topic`.
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            ..Self::default()
        }
    }

    /// Creates a request for `topic` whose answer should go to `reply_topic`.
    pub fn request(
        topic: impl Into<String>,
        reply_topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            flags: Flags::REQUEST,
            reply_topic: reply_topic.into(),
            ..Self::new(topic, payload)
        }
    }

    /// Creates the response to `request`, addressed to its reply topic.
    ///
    /// The sequence number and control data are copied so the requester can
    /// correlate the answer.
    pub fn response_to(request: &Self, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            sequence_number: request.sequence_number,
            control_data: request.control_data,
            flags: Flags::RESPONSE,
            ..Self::new(request.reply_topic.clone(), payload)
        }
    }

    /// Returns `true` if the REQUEST flag is set.
    pub const fn is_request(&self) -> bool {
        self.flags.contains(Flags::REQUEST)
    }

    /// Returns `true` if the RESPONSE flag is set.
    pub const fn is_response(&self) -> bool {
        self.flags.contains(Flags::RESPONSE)
    }

    /// Returns `true` if the router flagged the message as undeliverable.
    pub const fn is_undeliverable(&self) -> bool {
        self.flags.contains(Flags::UNDELIVERABLE)
    }

    /// Returns `true` if any timestamp slot is non-zero.
    pub fn has_timestamps(&self) -> bool {
        self.timestamps.iter().any(|&t| t != 0)
    }

    /// Exact header length this message encodes to.
    pub fn header_len(&self) -> usize {
        Header::expected_len(
            self.topic.len(),
            self.reply_topic.len(),
            self.has_timestamps(),
        )
    }

    /// Reassembles a message from a parsed header and its payload.
    pub fn from_parts(header: Header, payload: Vec<u8>) -> Self {
        Self {
            sequence_number: header.sequence_number,
            flags: header.flags,
            control_data: header.control_data,
            topic: header.topic,
            reply_topic: header.reply_topic,
            timestamps: header.timestamps,
            payload,
        }
    }
}
