//! Frame types and wire-format constants.
//!
//! Every frame on the wire is laid out as:
//!
//! ```text
//! len(4 BE) | request_id(8 BE) | flags(1) | cmd(3 BE) | payload(len - 12)
//! ```
//!
//! The length field covers everything after itself.

use std::sync::Arc;

use bytes::Bytes;

use crate::conn::ConnHandle;
use crate::error::Error;
use crate::flags::{FrameFlags, CMD_MASK};
use crate::info::ConnectionInfo;
use crate::stream::Stream;

/// Bytes covered by the length field before the payload starts:
/// request id (8) + flag byte (1) + command (3).
pub const FRAME_OVERHEAD: usize = 12;

/// Size of the full preamble including the length field itself.
pub const PREAMBLE_SIZE: usize = 4 + FRAME_OVERHEAD;

/// Default bound on the total frame size (length field plus its 4 bytes).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// A decoded inbound frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// The 64-bit request identifier naming this frame's stream.
    pub request_id: u64,
    /// Flag byte, unknown bits already dropped.
    pub flags: FrameFlags,
    /// 24-bit application command tag.
    pub cmd: u32,
    /// Payload bytes.
    pub payload: Bytes,
    /// The stream this frame belongs to. `None` for push frames, which
    /// bypass the stream table.
    pub(crate) stream: Option<Arc<Stream>>,
}

impl Frame {
    /// Decode a frame body (everything after the length field).
    ///
    /// The caller has already validated the length against the frame-size
    /// bound; this only rejects bodies shorter than the fixed header.
    pub(crate) fn decode(body: Bytes) -> Result<Self, Error> {
        if body.len() < FRAME_OVERHEAD {
            return Err(Error::InvalidPacket);
        }
        let request_id = u64::from_be_bytes([
            body[0], body[1], body[2], body[3], body[4], body[5], body[6], body[7],
        ]);
        let flags = FrameFlags::from_bits_truncate(body[8]);
        let cmd = u32::from_be_bytes([0, body[9], body[10], body[11]]) & CMD_MASK;
        Ok(Self {
            request_id,
            flags,
            cmd,
            payload: body.slice(FRAME_OVERHEAD..),
            stream: None,
        })
    }

    /// The stream this frame belongs to, if it has one.
    pub fn stream(&self) -> Option<&Arc<Stream>> {
        self.stream.as_ref()
    }
}

/// A received request frame as handed to a [`Handler`](crate::Handler),
/// carrying the connection it arrived on.
#[derive(Clone)]
pub struct RequestFrame {
    pub(crate) frame: Frame,
    pub(crate) conn: ConnHandle,
}

impl RequestFrame {
    /// The frame's request identifier.
    pub fn request_id(&self) -> u64 {
        self.frame.request_id
    }

    /// The frame's command tag.
    pub fn cmd(&self) -> u32 {
        self.frame.cmd
    }

    /// The frame's flags.
    pub fn flags(&self) -> FrameFlags {
        self.frame.flags
    }

    /// The frame's payload.
    pub fn payload(&self) -> &Bytes {
        &self.frame.payload
    }

    /// The stream this request belongs to, if any.
    pub fn stream(&self) -> Option<&Arc<Stream>> {
        self.frame.stream()
    }

    /// The connection this request arrived on.
    pub fn connection(&self) -> &ConnHandle {
        &self.conn
    }

    /// The per-connection info record, the place for identity, the user
    /// slot, and close notification.
    pub fn connection_info(&self) -> Arc<ConnectionInfo> {
        self.conn.connection_info()
    }
}

impl std::fmt::Debug for RequestFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestFrame")
            .field("request_id", &self.frame.request_id)
            .field("cmd", &self.frame.cmd)
            .field("flags", &self.frame.flags)
            .field("payload_len", &self.frame.payload.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(request_id: u64, flags: FrameFlags, cmd: u32, payload: &[u8]) -> Bytes {
        let mut b = Vec::with_capacity(FRAME_OVERHEAD + payload.len());
        b.extend_from_slice(&request_id.to_be_bytes());
        b.push(flags.bits());
        b.extend_from_slice(&cmd.to_be_bytes()[1..]);
        b.extend_from_slice(payload);
        Bytes::from(b)
    }

    #[test]
    fn decode_roundtrip() {
        let f = Frame::decode(body(
            0xDEAD_BEEF_0123_4567,
            FrameFlags::END_STREAM,
            0x00AB_CDEF,
            b"ping",
        ))
        .unwrap();
        assert_eq!(f.request_id, 0xDEAD_BEEF_0123_4567);
        assert_eq!(f.flags, FrameFlags::END_STREAM);
        assert_eq!(f.cmd, 0x00AB_CDEF);
        assert_eq!(&f.payload[..], b"ping");
    }

    #[test]
    fn decode_extreme_ids() {
        for id in [0u64, 1, u64::MAX] {
            let f = Frame::decode(body(id, FrameFlags::empty(), 0, b"")).unwrap();
            assert_eq!(f.request_id, id);
            assert!(f.payload.is_empty());
        }
    }

    #[test]
    fn decode_rejects_short_body() {
        let b = Bytes::from_static(&[0u8; FRAME_OVERHEAD - 1]);
        assert!(matches!(Frame::decode(b), Err(Error::InvalidPacket)));
    }

    #[test]
    fn unknown_flag_bits_are_ignored() {
        let mut raw = body(7, FrameFlags::NON_BLOCK, 0x10, b"x").to_vec();
        raw[8] |= 0b1010_0000;
        let f = Frame::decode(Bytes::from(raw)).unwrap();
        assert_eq!(f.flags, FrameFlags::NON_BLOCK);
    }
}
