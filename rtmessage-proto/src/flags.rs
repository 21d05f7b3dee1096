//! Header flag bits.

use bitflags::bitflags;

bitflags! {
    /// Bitset carried in the `flags` header field.
    ///
    /// Unknown bits survive a decode/encode cycle untouched.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Flags: u32 {
        /// The frame is a request; the receiver should answer on `reply_topic`.
        const REQUEST = 1;
        /// The frame answers an earlier request.
        const RESPONSE = 1 << 1;
        /// The router could not deliver the frame to any subscriber.
        const UNDELIVERABLE = 1 << 2;
        /// Set by the router on frames it considers tainted.
        const TAINTED = 1 << 3;
        /// The payload is raw bytes rather than a structured encoding.
        const RAW_BINARY = 1 << 4;
        /// The payload is encrypted by an upper layer.
        const ENCRYPTED = 1 << 5;
    }
}
