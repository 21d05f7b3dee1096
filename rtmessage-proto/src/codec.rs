//! Whole-frame codec: [`Message`] to bytes and back.
//!
//! Encoding computes `header_length` from the bytes it has just written and
//! back-patches it into the preamble before appending the trailing marker.
//! Decoding infers whether the timestamp block is present by comparing the
//! declared header length with the lengths implied by the two topics.

use crate::error::{Error, FrameError, Result};
use crate::message::{
    Header, MARKER, MAX_TOPIC_LEN, Message, PREAMBLE_LEN, Preamble, TIMESTAMP_COUNT, VERSION,
};
use crate::Flags;

/// Offset of the `header_length` field inside the preamble.
const HEADER_LEN_OFFSET: usize = 4;

/// Encodes `msg` into a freshly allocated frame.
pub fn encode(msg: &Message) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(msg.header_len() + msg.payload.len());
    encode_into(msg, &mut buf)?;
    Ok(buf)
}

/// Appends the encoded frame for `msg` to `buf`.
///
/// On error `buf` is left exactly as it was.
pub fn encode_into(msg: &Message, buf: &mut Vec<u8>) -> Result<()> {
    validate(msg)?;
    let payload_len = u32::try_from(msg.payload.len())
        .map_err(|_| Error::invalid_message("payload", "exceeds u32::MAX bytes"))?;

    let start = buf.len();
    buf.extend_from_slice(&MARKER.to_be_bytes());
    buf.extend_from_slice(&VERSION.to_be_bytes());
    buf.extend_from_slice(&0u16.to_be_bytes());
    for field in [
        msg.sequence_number,
        msg.flags.bits(),
        msg.control_data,
        payload_len,
    ] {
        buf.extend_from_slice(&field.to_be_bytes());
    }
    put_str(buf, &msg.topic);
    put_str(buf, &msg.reply_topic);
    if msg.has_timestamps() {
        for ts in msg.timestamps {
            buf.extend_from_slice(&ts.to_be_bytes());
        }
    }

    // Everything up to and including the trailing marker.
    let Ok(header_len) = u16::try_from(buf.len() - start + 2) else {
        buf.truncate(start);
        return Err(Error::invalid_message("header", "exceeds u16::MAX bytes"));
    };
    let at = start + HEADER_LEN_OFFSET;
    buf[at..at + 2].copy_from_slice(&header_len.to_be_bytes());

    buf.extend_from_slice(&MARKER.to_be_bytes());
    buf.extend_from_slice(&msg.payload);
    Ok(())
}

/// Decodes exactly one frame occupying all of `buf`.
pub fn decode(buf: &[u8]) -> Result<Message> {
    let preamble = Preamble::decode(buf)?;
    let header_len = usize::from(preamble.header_length);
    if buf.len() < header_len {
        return Err(FrameError::TruncatedFrame {
            field: "header",
            needed: header_len,
            remaining: buf.len(),
        }
        .into());
    }
    let header = Header::decode_body(preamble, &buf[PREAMBLE_LEN..header_len])?;

    let payload = &buf[header_len..];
    if payload.len() != header.payload_length as usize {
        return Err(FrameError::PayloadLengthMismatch {
            declared: header.payload_length,
            actual: payload.len(),
        }
        .into());
    }
    Ok(Message::from_parts(header, payload.to_vec()))
}

impl Preamble {
    /// Parses and validates the first [`PREAMBLE_LEN`] bytes of a frame.
    ///
    /// Rejects a bad marker, a foreign version, and a header length too
    /// small to hold the fixed fields.
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        let mut cur = Cursor::new(buf);
        let marker = cur.u16("marker")?;
        if marker != MARKER {
            return Err(FrameError::InvalidPreamble(marker));
        }
        let version = cur.u16("version")?;
        if version != VERSION {
            return Err(FrameError::UnsupportedVersion(version));
        }
        let header_length = cur.u16("header_length")?;
        if usize::from(header_length) < Header::expected_len(0, 0, false) {
            return Err(FrameError::UnknownHeaderLayout {
                declared: header_length,
                without_timestamps: Header::expected_len(0, 0, false),
                with_timestamps: Header::expected_len(0, 0, true),
            });
        }
        Ok(Self {
            version,
            header_length,
        })
    }
}

impl Header {
    /// Parses the header bytes following the preamble.
    ///
    /// `body` must be exactly `preamble.body_len()` bytes: everything from
    /// the sequence number through the trailing marker.
    pub fn decode_body(preamble: Preamble, body: &[u8]) -> Result<Self, FrameError> {
        let mut cur = Cursor::new(body);
        let sequence_number = cur.u32("sequence_number")?;
        let flags = Flags::from_bits_retain(cur.u32("flags")?);
        let control_data = cur.u32("control_data")?;
        let payload_length = cur.u32("payload_length")?;
        let topic = cur.string("topic")?;
        let reply_topic = cur.string("reply_topic")?;

        let declared = usize::from(preamble.header_length);
        let without = Self::expected_len(topic.len(), reply_topic.len(), false);
        let with = Self::expected_len(topic.len(), reply_topic.len(), true);
        let mut timestamps = [0u32; TIMESTAMP_COUNT];
        if declared == with {
            for ts in &mut timestamps {
                *ts = cur.u32("timestamp")?;
            }
        } else if declared != without {
            return Err(FrameError::UnknownHeaderLayout {
                declared: preamble.header_length,
                without_timestamps: without,
                with_timestamps: with,
            });
        }

        let marker = cur.u16("postamble")?;
        if marker != MARKER {
            return Err(FrameError::InvalidPostamble(marker));
        }

        Ok(Self {
            preamble,
            sequence_number,
            flags,
            control_data,
            payload_length,
            topic,
            reply_topic,
            timestamps,
        })
    }
}

/// Checks the field limits that the wire cannot express.
fn validate(msg: &Message) -> Result<()> {
    if msg.topic.is_empty() {
        return Err(Error::invalid_message("topic", "must not be empty"));
    }
    if msg.topic.len() > MAX_TOPIC_LEN {
        return Err(Error::invalid_message(
            "topic",
            format!("is {} bytes, limit is {MAX_TOPIC_LEN}", msg.topic.len()),
        ));
    }
    if msg.reply_topic.len() > MAX_TOPIC_LEN {
        return Err(Error::invalid_message(
            "reply_topic",
            format!(
                "is {} bytes, limit is {MAX_TOPIC_LEN}",
                msg.reply_topic.len()
            ),
        ));
    }
    if msg.flags.contains(Flags::REQUEST | Flags::RESPONSE) {
        return Err(Error::invalid_message(
            "flags",
            "REQUEST and RESPONSE are mutually exclusive",
        ));
    }
    Ok(())
}

/// Writes a `u32` length prefix followed by the string bytes.
#[allow(clippy::cast_possible_truncation)]
fn put_str(buf: &mut Vec<u8>, s: &str) {
    // Callers have already bounded `s` to MAX_TOPIC_LEN.
    buf.extend_from_slice(&(s.len() as u32).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
}

/// Bounds-checked big-endian reader over a byte slice.
struct Cursor<'a> {
    /// Bytes not yet consumed.
    rest: &'a [u8],
}

impl<'a> Cursor<'a> {
    /// Wraps `buf`.
    const fn new(buf: &'a [u8]) -> Self {
        Self { rest: buf }
    }

    /// Consumes `n` bytes.
    fn take(&mut self, field: &'static str, n: usize) -> Result<&'a [u8], FrameError> {
        if self.rest.len() < n {
            return Err(FrameError::TruncatedFrame {
                field,
                needed: n,
                remaining: self.rest.len(),
            });
        }
        let (head, tail) = self.rest.split_at(n);
        self.rest = tail;
        Ok(head)
    }

    /// Consumes a big-endian `u16`.
    fn u16(&mut self, field: &'static str) -> Result<u16, FrameError> {
        let b = self.take(field, 2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Consumes a big-endian `u32`.
    fn u32(&mut self, field: &'static str) -> Result<u32, FrameError> {
        let b = self.take(field, 4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Consumes a length-prefixed UTF-8 string.
    fn string(&mut self, field: &'static str) -> Result<String, FrameError> {
        let len = self.u32(field)? as usize;
        let bytes = self.take(field, len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| FrameError::InvalidUtf8(field))
    }
}
