//! Per-connection serve loop, dispatch, and the outbound write path.
//!
//! Each accepted connection gets exactly one reader task and one serve-loop
//! task. The reader pulls frames off the socket and hands them through an
//! inbound channel; the serve loop runs blocking handlers inline (holding
//! the reader back through the gate) and spawns non-blocking handlers onto
//! a join set that is drained at teardown. All wire writes funnel through
//! the connection write lock.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::ServerBinding;
use crate::error::Error;
use crate::flags::{FrameFlags, RST_CMD_ABORT};
use crate::frame::{Frame, RequestFrame};
use crate::info::{ConnectionInfo, Response};
use crate::metrics::{
    ERR_READ_OVERLAY, ERR_WRITE_OVERLAY, METHOD_READ_FRAMES, METHOD_WRITE_FRAME,
};
use crate::reader::FrameReader;
use crate::server::ServerInner;
use crate::stream::ConnStreams;
use crate::writer::{FrameSink, FrameWriter};

/// Connection-level cancellation token. Cancelling it unblocks the reader,
/// the serve loop, pending writes, and the throttle wait.
#[derive(Clone)]
pub(crate) struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub(crate) fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    pub(crate) async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

type WriteHalf = Box<dyn AsyncWrite + Unpin + Send>;

/// One inbound frame handed from the reader task to the serve loop.
/// `blocking` mirrors the absence of `NON_BLOCK` on the frame.
struct ReadFrameResult {
    frame: Frame,
    blocking: bool,
}

/// Shared state of one server-side connection.
pub(crate) struct ConnShared {
    pub(crate) binding: Arc<ServerBinding>,
    pub(crate) server: Weak<ServerInner>,
    pub(crate) idx: usize,
    pub(crate) conn_id: u64,
    remote_addr: String,
    pub(crate) streams: ConnStreams,
    info: Arc<ConnectionInfo>,
    wlock: AsyncMutex<Option<WriteHalf>>,
    write_timeout: Option<Duration>,
    pub(crate) shutdown: Shutdown,
    // First close wins; later closers wait on the watch below.
    untrack: AtomicBool,
    untracked_tx: watch::Sender<bool>,
}

impl ConnShared {
    /// Split `stream` and build the connection state. Returns the read
    /// half for the reader task; the write half lives behind the write
    /// lock.
    pub(crate) fn new<S>(
        stream: S,
        binding: Arc<ServerBinding>,
        server: Weak<ServerInner>,
        idx: usize,
        conn_id: u64,
        remote_addr: String,
    ) -> (Arc<Self>, Box<dyn AsyncRead + Unpin + Send>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (r, w) = tokio::io::split(stream);
        let (untracked_tx, _) = watch::channel(false);
        let write_timeout = binding.default_write_timeout;
        let shared = Arc::new(Self {
            binding,
            server,
            idx,
            conn_id,
            remote_addr,
            streams: ConnStreams::new(),
            info: Arc::new(ConnectionInfo::new()),
            wlock: AsyncMutex::new(Some(Box::new(w))),
            write_timeout,
            shutdown: Shutdown::new(),
            untrack: AtomicBool::new(false),
            untracked_tx,
        });
        (shared, Box::new(r))
    }

    /// Write one finished frame buffer to the wire, recording its stream
    /// state first. Every writer's `end_write` lands here.
    pub(crate) async fn write_frame(
        &self,
        request_id: u64,
        flags: FrameFlags,
        buf: &[u8],
    ) -> Result<(), Error> {
        if self.shutdown.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }

        let mut guard = self.wlock.lock().await;

        if flags.is_rst() {
            let Some(stream) = self.streams.get(request_id) else {
                return Err(Error::RstNonexistentStream);
            };
            // A refused rst means the stream already reset itself; nothing
            // to send.
            if !self.streams.add_out_frame(&stream, request_id, flags) {
                return Ok(());
            }
        } else if !flags.is_push() {
            let (stream, loaded) = self.streams.create_or_get(request_id, flags);
            if !loaded {
                tracing::debug!(request_id, ?flags, "new outbound stream");
            }
            if !self.streams.add_out_frame(&stream, request_id, flags) {
                return Err(Error::WriteAfterSelfClose);
            }
        }

        let Some(w) = guard.as_mut() else {
            return Err(Error::ConnectionClosed);
        };
        // Cancellation must be able to abort a write blocked on a peer
        // that stopped reading; close() relies on this to take the lock.
        let written = tokio::select! {
            res = write_all_timeout(w, buf, self.write_timeout) => res,
            _ = self.shutdown.cancelled() => Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionAborted,
                "connection closed",
            )),
        };
        match written {
            Ok(()) => Ok(()),
            Err(e) => {
                // Drop the write half so no later writer touches a socket
                // in an unknown state, then tear the connection down.
                *guard = None;
                drop(guard);
                tracing::debug!(remote = %self.remote_addr, error = %e, "write frame failed");
                if let Err(close_err) = self.close().await {
                    tracing::debug!(error = %close_err, "close after write failure");
                }
                self.record_failure(METHOD_WRITE_FRAME, &e.to_string());
                Err(Error::Io(e))
            }
        }
    }

    pub(crate) fn info(&self) -> Arc<ConnectionInfo> {
        self.info.clone()
    }

    pub(crate) fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// Close the connection: rate-limit, untrack exactly once (concurrent
    /// callers wait for the winner), shut the socket down, cancel the
    /// context, and fan out close notifications outside the info lock.
    pub(crate) async fn close(&self) -> Result<(), Error> {
        if let Some(server) = self.server.upgrade() {
            server.limit_close(self.idx).await;
        }

        if self.untrack.swap(true, Ordering::SeqCst) {
            let mut rx = self.untracked_tx.subscribe();
            loop {
                if *rx.borrow() {
                    return Ok(());
                }
                if rx.changed().await.is_err() {
                    return Ok(());
                }
            }
        }

        if let Some(server) = self.server.upgrade() {
            server.untrack(self.idx, self.conn_id, &self.info.get_id());
        }

        // Cancel first: a writer blocked mid-frame aborts and releases the
        // write lock, so taking it below cannot wedge.
        self.shutdown.cancel();
        let shutdown_res = {
            let mut guard = self.wlock.lock().await;
            match guard.take() {
                Some(mut w) => w.shutdown().await,
                None => Ok(()),
            }
        };

        let notifies = self.info.mark_closed();
        for f in notifies {
            f();
        }

        let _ = self.untracked_tx.send(true);
        shutdown_res.map_err(Error::Io)
    }

    fn record_failure(&self, method: &str, err: &str) {
        let Some(counter) = &self.binding.counter_metric else {
            return;
        };
        let err = if self.binding.overlay_network {
            match method {
                METHOD_READ_FRAMES => ERR_READ_OVERLAY,
                _ => ERR_WRITE_OVERLAY,
            }
        } else {
            err
        };
        counter.add(&[("method", method), ("error", err)], 1);
    }

    fn instrument(&self, cmd: u32, begin: Instant, err: &str) {
        if self.binding.counter_metric.is_none() && self.binding.latency_metric.is_none() {
            return;
        }
        let cmd_label = cmd.to_string();
        let labels = [("method", cmd_label.as_str()), ("error", err)];
        if let Some(counter) = &self.binding.counter_metric {
            counter.add(&labels, 1);
        }
        if let Some(latency) = &self.binding.latency_metric {
            latency.observe(&labels, begin.elapsed().as_secs_f64());
        }
    }
}

impl FrameSink for ConnShared {
    fn submit_frame<'a>(
        &'a self,
        request_id: u64,
        flags: FrameFlags,
        buf: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send + 'a>> {
        Box::pin(self.write_frame(request_id, flags, buf))
    }
}

async fn write_all_timeout(
    w: &mut WriteHalf,
    buf: &[u8],
    timeout: Option<Duration>,
) -> std::io::Result<()> {
    let write = async {
        w.write_all(buf).await?;
        w.flush().await
    };
    match timeout {
        Some(t) => match tokio::time::timeout(t, write).await {
            Ok(res) => res,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "write timed out",
            )),
        },
        None => write.await,
    }
}

/// Cloneable handle to a live connection, as seen by handlers and by the
/// server registry. Holds the binding index and shared state only; the
/// server side owns the connection, never the reverse.
#[derive(Clone)]
pub struct ConnHandle {
    pub(crate) shared: Arc<ConnShared>,
}

impl ConnHandle {
    /// A fresh outbound frame writer for this connection. Writers are not
    /// shared between producers; mint one per task.
    pub fn writer(&self) -> FrameWriter {
        FrameWriter::new(self.shared.clone())
    }

    /// The per-connection info record.
    pub fn connection_info(&self) -> Arc<ConnectionInfo> {
        self.shared.info()
    }

    /// The peer's address.
    pub fn remote_addr(&self) -> &str {
        self.shared.remote_addr()
    }

    /// Set the connection identity and register it with the server so the
    /// application can find this connection by name.
    ///
    /// # Panics
    ///
    /// Panics on an empty id or a second call, like any other handler
    /// programming error.
    pub fn set_id(&self, id: &str) {
        self.shared.info.set_id_once(id);
        if let Some(server) = self.shared.server.upgrade() {
            server.bind_id(self.shared.idx, id, self.shared.conn_id);
        }
    }

    /// The connection identity, empty until set.
    pub fn get_id(&self) -> String {
        self.shared.info.get_id()
    }

    /// Initiate a request to the peer. Allocates a fresh request id,
    /// registers a response slot, and sends the frame with `NON_BLOCK`
    /// forced on. The reply arrives through the returned [`Response`];
    /// the handler never sees it.
    pub async fn request(
        &self,
        cmd: u32,
        flags: FrameFlags,
        payload: &[u8],
    ) -> Result<(u64, Response), Error> {
        if self.shared.untrack.load(Ordering::SeqCst) {
            return Err(Error::ConnAlreadyClosed);
        }
        let (request_id, resp) = self.shared.info.register_response()?;
        let mut w = self.writer();
        w.start_write(request_id, cmd, flags | FrameFlags::NON_BLOCK);
        w.write_bytes(payload);
        if let Err(e) = w.end_write().await {
            self.shared.info.remove_pending(request_id);
            return Err(e);
        }
        Ok((request_id, resp))
    }

    /// Close the connection. Idempotent: the first caller performs the
    /// teardown, concurrent callers observe the same completion.
    pub async fn close(&self) -> Result<(), Error> {
        self.shared.close().await
    }
}

/// Serve one connection to completion. Spawns the reader task, runs the
/// dispatch selector, and tears everything down on exit: close the socket,
/// join every spawned task, release the stream table.
pub(crate) async fn serve(shared: Arc<ConnShared>, read_half: Box<dyn AsyncRead + Unpin + Send>) {
    let reader = FrameReader::new(
        read_half,
        shared.binding.effective_max_frame_size(),
        shared.binding.default_read_timeout,
    );
    let (tx, mut rx) = mpsc::channel::<ReadFrameResult>(shared.binding.read_frame_ch_size.max(1));
    let gate = Arc::new(Semaphore::new(0));

    let mut tasks: JoinSet<()> = JoinSet::new();
    {
        let shared = shared.clone();
        let gate = gate.clone();
        tasks.spawn(read_frames(shared, reader, tx, gate));
    }

    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            res = rx.recv() => match res {
                Some(res) if res.blocking => {
                    dispatch(&shared, res.frame).await;
                    gate.add_permits(1);
                }
                Some(res) => {
                    let shared = shared.clone();
                    tasks.spawn(async move {
                        dispatch(&shared, res.frame).await;
                    });
                }
                None => break,
            },
        }
    }

    if let Err(e) = shared.close().await {
        tracing::debug!(remote = %shared.remote_addr, error = %e, "close connection");
    }
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            if e.is_panic() {
                tracing::error!(remote = %shared.remote_addr, "connection task panicked");
            }
        }
    }
    shared.streams.release();
    tracing::debug!(remote = %shared.remote_addr, "connection finished");
}

/// The reader task. Applies the gating protocol: non-blocking frames are
/// sent and forgotten, blocking frames park the reader on the gate until
/// the serve loop has run the handler. At most one blocking frame is in
/// flight per connection.
async fn read_frames(
    shared: Arc<ConnShared>,
    mut reader: FrameReader,
    tx: mpsc::Sender<ReadFrameResult>,
    gate: Arc<Semaphore>,
) {
    let exit: Error = loop {
        let frame = match reader.read_frame(&shared.streams).await {
            Ok(frame) => frame,
            Err(e) => {
                if matches!(e, Error::FrameTooLarge { .. }) {
                    tracing::error!(remote = %shared.remote_addr, error = %e, "frame too large");
                }
                if let Err(close_err) = shared.close().await {
                    tracing::debug!(error = %close_err, "close after read failure");
                }
                reader.finalize();
                break e;
            }
        };

        // Replies to requests we originated bypass dispatch entirely.
        if frame.flags.is_from_server() {
            if let Some(slot) = shared.info.take_pending(frame.request_id) {
                let _ = slot.send(frame);
                continue;
            }
        }

        let blocking = !frame.flags.is_non_block();
        let res = ReadFrameResult { frame, blocking };
        tokio::select! {
            sent = tx.send(res) => {
                if sent.is_err() {
                    break Error::ConnectionClosed;
                }
            }
            _ = shared.shutdown.cancelled() => break Error::ConnectionClosed,
        }

        if blocking {
            tokio::select! {
                permit = gate.acquire() => match permit {
                    Ok(p) => p.forget(),
                    Err(_) => break Error::ConnectionClosed,
                },
                _ = shared.shutdown.cancelled() => break Error::ConnectionClosed,
            }
        }

        if let Some(server) = shared.server.upgrade() {
            server.wait_throttle(shared.idx, &shared.shutdown).await;
        }
    };

    shared.record_failure(METHOD_READ_FRAMES, &exit.to_string());
}

/// Run one handler invocation inside the dispatch boundary: time it,
/// catch panics, record metrics, and reset the stream if the handler left
/// it open.
async fn dispatch(shared: &Arc<ConnShared>, frame: Frame) {
    let begin = Instant::now();
    if let Some(server) = shared.server.upgrade() {
        server.enter_dispatch(shared.idx);
    }

    let request_id = frame.request_id;
    let cmd = frame.cmd;
    let stream = frame.stream.clone();
    let req = RequestFrame {
        frame,
        conn: ConnHandle {
            shared: shared.clone(),
        },
    };
    let sink: Arc<dyn FrameSink> = shared.clone();
    let writer = FrameWriter::new(sink);

    let handler = shared.binding.handler.clone();
    let outcome = AssertUnwindSafe(handler.serve(writer, req)).catch_unwind().await;

    let err_label = match &outcome {
        Ok(()) => String::new(),
        Err(panic) => panic_message(panic.as_ref()),
    };
    shared.instrument(cmd, begin, &err_label);
    if outcome.is_err() {
        tracing::error!(
            remote = %shared.remote_addr,
            request_id,
            panic = %err_label,
            "handler panicked"
        );
    }

    // A handler that finished without closing its stream did not complete
    // the exchange; tell the peer.
    let self_closed = stream.map(|s| s.is_self_closed()).unwrap_or(false);
    if !self_closed {
        let sink: Arc<dyn FrameSink> = shared.clone();
        let mut w = FrameWriter::new(sink);
        if let Err(e) = w.reset_frame(request_id, RST_CMD_ABORT).await {
            tracing::debug!(request_id, error = %e, "send abort reset");
        }
    }

    if let Some(server) = shared.server.upgrade() {
        server.exit_dispatch(shared.idx);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}
