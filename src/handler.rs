//! Handler trait and command-based routing.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::frame::RequestFrame;
use crate::writer::FrameWriter;

/// The single application entry point for dispatched request frames.
///
/// `writer` is a fresh outbound frame writer bound to the request's
/// connection; `frame` is the received request. Depending on the frame's
/// `NON_BLOCK` flag the handler runs inline on the serve loop (blocking
/// dispatch, strict wire order) or on its own task (non-blocking dispatch).
/// Handlers may freely use the writer, mint more writers from
/// `frame.connection()`, and send additional frames within the stream.
pub trait Handler: Send + Sync + 'static {
    /// Serve one request frame.
    fn serve(
        &self,
        writer: FrameWriter,
        frame: RequestFrame,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
}

/// Adapter turning an async closure into a [`Handler`].
pub struct HandlerFn<F>(F);

impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(FrameWriter, RequestFrame) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn serve(
        &self,
        writer: FrameWriter,
        frame: RequestFrame,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>> {
        Box::pin((self.0)(writer, frame))
    }
}

/// Wrap an async closure as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(FrameWriter, RequestFrame) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    HandlerFn(f)
}

/// Routes request frames to handlers by command tag.
///
/// Unknown commands are logged and left unanswered; the dispatch boundary
/// then resets the stream, which is what the peer observes.
#[derive(Default)]
pub struct ServeMux {
    handlers: HashMap<u32, Arc<dyn Handler>>,
}

impl ServeMux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `cmd`. A second registration for the same
    /// command replaces the first.
    pub fn handle(&mut self, cmd: u32, handler: Arc<dyn Handler>) {
        self.handlers.insert(cmd, handler);
    }

    /// Register an async closure for `cmd`.
    pub fn handle_func<F, Fut>(&mut self, cmd: u32, f: F)
    where
        F: Fn(FrameWriter, RequestFrame) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handle(cmd, Arc::new(handler_fn(f)));
    }
}

impl Handler for ServeMux {
    fn serve(
        &self,
        writer: FrameWriter,
        frame: RequestFrame,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>> {
        match self.handlers.get(&frame.cmd()) {
            Some(h) => h.serve(writer, frame),
            None => {
                tracing::warn!(cmd = frame.cmd(), request_id = frame.request_id(), "no handler for cmd");
                Box::pin(async {})
            }
        }
    }
}
