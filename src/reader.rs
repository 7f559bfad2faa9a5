//! Inbound frame deframing.

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::Error;
use crate::frame::{Frame, FRAME_OVERHEAD};
use crate::stream::ConnStreams;

/// Pulls length-prefixed frames off the connection's read half, applying
/// the max-frame-size bound and the inbound half of the stream table's
/// lifecycle bookkeeping. Owned exclusively by the connection's reader
/// task; the read side of the socket is touched by nothing else.
pub(crate) struct FrameReader {
    r: Box<dyn AsyncRead + Unpin + Send>,
    buf: Vec<u8>,
    max_frame_size: usize,
    read_timeout: Option<Duration>,
}

impl FrameReader {
    pub(crate) fn new(
        r: Box<dyn AsyncRead + Unpin + Send>,
        max_frame_size: usize,
        read_timeout: Option<Duration>,
    ) -> Self {
        Self {
            r,
            buf: Vec::new(),
            max_frame_size,
            read_timeout,
        }
    }

    /// Read the next frame.
    ///
    /// A clean EOF at a frame boundary reports `ConnectionClosed`; every
    /// other failure is fatal for the connection. Non-push frames are run
    /// through the stream table and arrive with their stream attached;
    /// frames arriving after their stream closed in the inbound direction
    /// (late frames racing a reset) are dropped here and never dispatched.
    pub(crate) async fn read_frame(&mut self, streams: &ConnStreams) -> Result<Frame, Error> {
        loop {
            let mut len_buf = [0u8; 4];
            match self.read_exact(&mut len_buf).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Err(Error::ConnectionClosed);
                }
                Err(e) => return Err(Error::Io(e)),
            }

            let length = u32::from_be_bytes(len_buf) as usize;
            if length < FRAME_OVERHEAD {
                return Err(Error::InvalidPacket);
            }
            if length + 4 > self.max_frame_size {
                return Err(Error::FrameTooLarge {
                    size: length + 4,
                    max: self.max_frame_size,
                });
            }

            self.buf.resize(length, 0);
            let mut body = std::mem::take(&mut self.buf);
            let res = self.read_exact(&mut body).await;
            self.buf = body;
            res.map_err(Error::Io)?;

            let mut frame = Frame::decode(Bytes::copy_from_slice(&self.buf))?;

            if !frame.flags.is_push() {
                let (stream, loaded) = streams.create_or_get(frame.request_id, frame.flags);
                if !loaded {
                    tracing::debug!(request_id = frame.request_id, "new inbound stream");
                }
                if !streams.add_in_frame(&stream, frame.request_id, frame.flags) {
                    tracing::debug!(
                        request_id = frame.request_id,
                        flags = ?frame.flags,
                        "drop frame for closed stream"
                    );
                    continue;
                }
                frame.stream = Some(stream);
            }

            return Ok(frame);
        }
    }

    /// Release reader-side buffers. Called once the reader task gives up
    /// on the connection.
    pub(crate) fn finalize(&mut self) {
        self.buf = Vec::new();
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        match self.read_timeout {
            Some(t) => match tokio::time::timeout(t, self.r.read_exact(buf)).await {
                Ok(res) => res.map(|_| ()),
                Err(_) => Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "read timed out",
                )),
            },
            None => self.r.read_exact(buf).await.map(|_| ()),
        }
    }
}
