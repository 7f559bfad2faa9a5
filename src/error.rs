//! Error types surfaced by the transport core.

use core::fmt;

/// Errors produced by the framing, stream, and dispatch engine.
#[derive(Debug)]
pub enum Error {
    /// Malformed frame on the wire.
    InvalidPacket,
    /// A frame exceeded the configured maximum size. Fatal for the
    /// connection.
    FrameTooLarge { size: usize, max: usize },
    /// An outbound reset targeted a request id with no live stream.
    RstNonexistentStream,
    /// An outbound non-reset frame was attempted after the stream's
    /// self-close.
    WriteAfterSelfClose,
    /// A server-initiated request was attempted on a connection that is
    /// already being torn down.
    ConnAlreadyClosed,
    /// Request-id allocation exhausted its probe budget.
    NoNewUuid,
    /// The operation raced with connection teardown.
    ConnectionClosed,
    /// An I/O error from the underlying byte stream. The inner error is the
    /// root cause; nothing re-wraps it.
    Io(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPacket => write!(f, "invalid packet"),
            Self::FrameTooLarge { size, max } => {
                write!(f, "frame too large: {size} bytes exceeds max {max}")
            }
            Self::RstNonexistentStream => write!(f, "reset nonexistent stream"),
            Self::WriteAfterSelfClose => write!(f, "write after stream self-close"),
            Self::ConnAlreadyClosed => write!(f, "connection already closed"),
            Self::NoNewUuid => write!(f, "no new uuid"),
            Self::ConnectionClosed => write!(f, "connection closed"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
