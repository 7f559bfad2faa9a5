//! weft: server-side core of a binary, length-prefixed, stream-multiplexed
//! RPC transport.
//!
//! One TCP connection carries many logically independent request/response
//! exchanges, identified by a 64-bit request id. This crate provides:
//! - frame encoding and decoding ([`FrameWriter`], the wire constants in
//!   [`frame`])
//! - the per-stream lifecycle table with half-close admission rules
//!   ([`Stream`])
//! - the per-connection serve loop with blocking (backpressured) and
//!   non-blocking dispatch to a [`Handler`]
//! - server-initiated requests with pending-response routing
//!   ([`ConnHandle::request`], [`Response`])
//! - the listening [`Server`] with per-binding configuration
//!   ([`ServerBinding`])
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use weft::{handler_fn, Server, ServerBinding};
//!
//! # async fn run() -> Result<(), weft::Error> {
//! let echo = handler_fn(|mut writer, frame: weft::RequestFrame| async move {
//!     writer.start_write(frame.request_id(), frame.cmd(), Default::default());
//!     writer.write_bytes(frame.payload());
//!     let _ = writer.stream_end_write(true).await;
//! });
//! let server = Server::new(vec![ServerBinding::new("0.0.0.0:8080", Arc::new(echo))]);
//! server.serve().await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod conn;
mod error;
mod flags;
pub mod frame;
mod handler;
mod info;
pub mod metrics;
mod reader;
mod server;
mod stream;
mod writer;

pub use config::ServerBinding;
pub use conn::ConnHandle;
pub use error::Error;
pub use flags::{FrameFlags, CMD_MASK, RST_CMD_ABORT};
pub use frame::{Frame, RequestFrame, DEFAULT_MAX_FRAME_SIZE};
pub use handler::{handler_fn, Handler, HandlerFn, ServeMux};
pub use info::{ConnectionInfo, Response};
pub use metrics::{CounterMetric, LatencyMetric};
pub use server::Server;
pub use stream::Stream;
pub use writer::FrameWriter;
