//! Outbound frame construction.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::Error;
use crate::flags::{FrameFlags, CMD_MASK};
use crate::frame::PREAMBLE_SIZE;

/// Atomic frame submission, implemented by the connection. A finished
/// buffer is either written to the wire whole or not at all; concurrent
/// writers are serialized behind the connection write lock.
pub(crate) trait FrameSink: Send + Sync {
    fn submit_frame<'a>(
        &'a self,
        request_id: u64,
        flags: FrameFlags,
        buf: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send + 'a>>;
}

/// Builds one outbound frame at a time in a scratch buffer and hands the
/// finished bytes to the connection.
///
/// A writer is single-producer state: each handler invocation and each
/// server-originated request uses its own instance. Multiple writers
/// compete for the connection write lock only inside [`end_write`].
///
/// [`end_write`]: FrameWriter::end_write
pub struct FrameWriter {
    sink: Arc<dyn FrameSink>,
    wbuf: Vec<u8>,
    request_id: u64,
    cmd: u32,
    flags: FrameFlags,
}

impl FrameWriter {
    pub(crate) fn new(sink: Arc<dyn FrameSink>) -> Self {
        Self {
            sink,
            wbuf: Vec::new(),
            request_id: 0,
            cmd: 0,
            flags: FrameFlags::empty(),
        }
    }

    /// Begin a frame: reset the scratch buffer and write the preamble.
    /// The length prefix stays zero until [`end_write`](Self::end_write)
    /// patches it.
    pub fn start_write(&mut self, request_id: u64, cmd: u32, flags: FrameFlags) {
        self.request_id = request_id;
        self.cmd = cmd & CMD_MASK;
        self.flags = flags;
        self.wbuf.clear();
        self.wbuf.extend_from_slice(&[0, 0, 0, 0]);
        self.wbuf.extend_from_slice(&request_id.to_be_bytes());
        self.wbuf.push(flags.bits());
        self.wbuf.extend_from_slice(&self.cmd.to_be_bytes()[1..]);
    }

    /// The command of the frame being built.
    pub fn cmd(&self) -> u32 {
        self.cmd
    }

    /// The request id of the frame being built.
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// The flags of the frame being built.
    pub fn flags(&self) -> FrameFlags {
        self.flags
    }

    /// Append a big-endian u8.
    pub fn write_u8(&mut self, v: u8) {
        self.wbuf.push(v);
    }

    /// Append a big-endian u16.
    pub fn write_u16(&mut self, v: u16) {
        self.wbuf.extend_from_slice(&v.to_be_bytes());
    }

    /// Append a big-endian u32.
    pub fn write_u32(&mut self, v: u32) {
        self.wbuf.extend_from_slice(&v.to_be_bytes());
    }

    /// Append a big-endian u64.
    pub fn write_u64(&mut self, v: u64) {
        self.wbuf.extend_from_slice(&v.to_be_bytes());
    }

    /// Append raw bytes.
    pub fn write_bytes(&mut self, v: &[u8]) {
        self.wbuf.extend_from_slice(v);
    }

    /// Finish the frame: patch the length prefix and the flag byte (flags
    /// may have changed since `start_write`), then submit atomically.
    pub async fn end_write(&mut self) -> Result<(), Error> {
        debug_assert!(
            self.wbuf.len() >= PREAMBLE_SIZE,
            "end_write without start_write"
        );
        let length = (self.wbuf.len() - 4) as u32;
        self.wbuf[..4].copy_from_slice(&length.to_be_bytes());
        self.wbuf[12] = self.flags.bits();
        self.sink
            .submit_frame(self.request_id, self.flags, &self.wbuf)
            .await
    }

    /// Finish the frame, first marking it as the stream's last outbound
    /// frame when `end` is set.
    pub async fn stream_end_write(&mut self, end: bool) -> Result<(), Error> {
        if end {
            self.flags |= FrameFlags::END_STREAM;
        }
        self.end_write().await
    }

    /// Emit a reset frame for `request_id` with the given reason.
    pub async fn reset_frame(&mut self, request_id: u64, reason: u32) -> Result<(), Error> {
        self.start_write(request_id, reason, FrameFlags::RST);
        self.end_write().await
    }
}
