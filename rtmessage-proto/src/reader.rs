//! Incremental frame reader over a byte stream.
//!
//! A single socket read may return part of a frame or several frames at
//! once. [`FrameReader`] walks three states, each of which reads exactly the
//! number of bytes it needs before moving on:
//!
//! 1. preamble: 6 bytes (marker, version, header length)
//! 2. header body: `header_length - 6` bytes
//! 3. payload: `payload_length` bytes
//!
//! Any I/O or validation failure is fatal. The reader does not try to
//! resynchronize, and every later call reports the stream as broken.

use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};
use crate::message::{Header, Message, PREAMBLE_LEN, Preamble};

/// Where the reader is within the current frame.
#[derive(Debug)]
enum State {
    /// Waiting for the start of a frame.
    AwaitingPreamble,
    /// Preamble validated; reading the rest of the header.
    AwaitingHeaderBody(Preamble),
    /// Header parsed; reading the payload.
    AwaitingPayload(Header),
    /// An earlier call failed; the stream position is unknown.
    Failed,
}

/// Pulls complete [`Message`]s off an [`AsyncRead`] stream.
///
/// `next_frame` is not cancel-safe: dropping its future mid-frame loses the
/// bytes read so far. Only drop it when abandoning the stream.
#[derive(Debug)]
pub struct FrameReader<R> {
    /// The underlying byte stream.
    inner: R,
    /// Current position in the frame state machine.
    state: State,
    /// Limit on each read once a frame has started.
    read_timeout: Option<Duration>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wraps `inner` with no read timeout.
    pub const fn new(inner: R) -> Self {
        Self {
            inner,
            state: State::AwaitingPreamble,
            read_timeout: None,
        }
    }

    /// Bounds how long the header body and the payload may each take to
    /// arrive once a frame's preamble has been read.
    ///
    /// The wait for the first byte of a frame is never bounded: an idle bus
    /// is not an error.
    #[must_use]
    pub const fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Returns the wrapped stream.
    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Reads the next complete frame.
    ///
    /// Returns `Ok(None)` when the stream ends cleanly between frames.
    pub async fn next_frame(&mut self) -> Result<Option<Message>> {
        match self.advance().await {
            Ok(frame) => Ok(frame),
            Err(e) => {
                self.state = State::Failed;
                Err(e)
            }
        }
    }

    /// Drives the state machine until a frame completes or the stream ends.
    async fn advance(&mut self) -> Result<Option<Message>> {
        loop {
            match std::mem::replace(&mut self.state, State::AwaitingPreamble) {
                State::AwaitingPreamble => {
                    let mut buf = [0u8; PREAMBLE_LEN];
                    if !self.read_preamble(&mut buf).await? {
                        return Ok(None);
                    }
                    self.state = State::AwaitingHeaderBody(Preamble::decode(&buf)?);
                }
                State::AwaitingHeaderBody(preamble) => {
                    let mut buf = vec![0u8; preamble.body_len()];
                    self.read_full(&mut buf).await?;
                    self.state = State::AwaitingPayload(Header::decode_body(preamble, &buf)?);
                }
                State::AwaitingPayload(header) => {
                    let payload = self.read_payload(header.payload_length).await?;
                    return Ok(Some(Message::from_parts(header, payload)));
                }
                State::Failed => {
                    self.state = State::Failed;
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "stream desynchronized by an earlier frame error",
                    )));
                }
            }
        }
    }

    /// Fills `buf` with the preamble, waiting indefinitely for its first byte.
    ///
    /// Returns `false` on a clean end of stream before any byte arrived.
    async fn read_preamble(&mut self, buf: &mut [u8]) -> Result<bool> {
        let n = self.inner.read(buf).await?;
        if n == 0 {
            return Ok(false);
        }
        self.read_full(&mut buf[n..]).await?;
        Ok(true)
    }

    /// Fills `buf` completely, looping over short reads.
    async fn read_full(&mut self, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        within(self.read_timeout, self.inner.read_exact(buf)).await?;
        Ok(())
    }

    /// Reads a `len`-byte payload, growing the buffer only as bytes arrive.
    ///
    /// The declared length comes off the wire and is not trusted for the
    /// initial allocation.
    async fn read_payload(&mut self, len: u32) -> Result<Vec<u8>> {
        let declared = u64::from(len);
        let mut payload = Vec::with_capacity(
            usize::try_from(len).map_or(PAYLOAD_PREALLOC, |n| n.min(PAYLOAD_PREALLOC)),
        );
        within(
            self.read_timeout,
            (&mut self.inner).take(declared).read_to_end(&mut payload),
        )
        .await?;
        if u64::try_from(payload.len()).is_ok_and(|n| n == declared) {
            Ok(payload)
        } else {
            Err(io::Error::new(io::ErrorKind::UnexpectedEof, "stream ended inside a payload").into())
        }
    }
}

/// Upper bound on the payload buffer reserved before any payload byte arrives.
const PAYLOAD_PREALLOC: usize = 64 * 1024;

/// Runs a read under the optional frame timeout.
async fn within<T>(
    limit: Option<Duration>,
    read: impl Future<Output = io::Result<T>>,
) -> io::Result<T> {
    match limit {
        Some(after) => tokio::time::timeout(after, read)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "frame read timed out"))?,
        None => read.await,
    }
}
