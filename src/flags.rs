//! Frame flags and command tags.

use bitflags::bitflags;

bitflags! {
    /// Flags carried in the single flag byte of each frame.
    ///
    /// Unknown bits MUST be ignored on receive and MUST NOT be set on send;
    /// decoding therefore goes through [`FrameFlags::from_bits_truncate`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FrameFlags: u8 {
        /// Dispatch must not apply backpressure to the reader while the
        /// handler runs.
        const NON_BLOCK   = 0b0000_0001;

        /// Last frame of the stream in its direction.
        const END_STREAM  = 0b0000_0010;

        /// Resets the stream; terminal in both directions.
        const RST         = 0b0000_0100;

        /// Server-initiated frame not associated with a client stream;
        /// skips stream-table bookkeeping on the outbound path.
        const PUSH        = 0b0000_1000;

        /// The peer is responding to a request we originated; routed to the
        /// pending-response table instead of the handler.
        const FROM_SERVER = 0b0001_0000;
    }
}

impl FrameFlags {
    /// Whether this frame requests non-blocking dispatch.
    #[inline]
    pub fn is_non_block(self) -> bool {
        self.contains(FrameFlags::NON_BLOCK)
    }

    /// Whether this frame ends its stream direction.
    #[inline]
    pub fn is_end_stream(self) -> bool {
        self.contains(FrameFlags::END_STREAM)
    }

    /// Whether this frame resets its stream.
    #[inline]
    pub fn is_rst(self) -> bool {
        self.contains(FrameFlags::RST)
    }

    /// Whether this is a push frame.
    #[inline]
    pub fn is_push(self) -> bool {
        self.contains(FrameFlags::PUSH)
    }

    /// Whether this frame answers a request we originated.
    #[inline]
    pub fn is_from_server(self) -> bool {
        self.contains(FrameFlags::FROM_SERVER)
    }
}

/// Commands are 24-bit application-owned tags; the core never interprets
/// them. Values above this mask are truncated on the wire.
pub const CMD_MASK: u32 = 0x00FF_FFFF;

/// Reset reason emitted by the dispatch boundary when a handler completes
/// (or panics) without closing its stream.
pub const RST_CMD_ABORT: u32 = 0;
