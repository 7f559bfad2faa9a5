//! Server: listen endpoints, the connection registry, and per-binding
//! admission control.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::config::ServerBinding;
use crate::conn::{self, ConnHandle, ConnShared, Shutdown};
use crate::error::Error;

/// Token-bucket limiter for connection closes, refilled continuously.
pub(crate) struct RateLimiter {
    per_sec: f64,
    state: AsyncMutex<LimiterState>,
}

struct LimiterState {
    tokens: f64,
    last: Instant,
}

impl RateLimiter {
    fn new(per_sec: u32) -> Self {
        Self {
            per_sec: per_sec as f64,
            state: AsyncMutex::new(LimiterState {
                tokens: per_sec as f64,
                last: Instant::now(),
            }),
        }
    }

    pub(crate) async fn take(&self) {
        loop {
            let wait = {
                let mut st = self.state.lock().await;
                let now = Instant::now();
                let refill = now.duration_since(st.last).as_secs_f64() * self.per_sec;
                st.tokens = (st.tokens + refill).min(self.per_sec);
                st.last = now;
                if st.tokens >= 1.0 {
                    st.tokens -= 1.0;
                    None
                } else {
                    Some(Duration::from_secs_f64((1.0 - st.tokens) / self.per_sec))
                }
            };
            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }
}

/// Per-binding mutable state.
struct BindingRuntime {
    /// Dispatches currently in flight on this binding.
    inflight: AtomicUsize,
    /// Woken whenever a dispatch finishes, for throttled readers.
    throttle: Notify,
    /// Identity (from `set_id`) to connection serial.
    ids: Mutex<HashMap<String, u64>>,
    close_limiter: Option<RateLimiter>,
}

pub(crate) struct ServerInner {
    bindings: Vec<Arc<ServerBinding>>,
    runtime: Vec<BindingRuntime>,
    conns: Mutex<HashMap<u64, ConnHandle>>,
    next_conn_id: AtomicU64,
    pub(crate) shutdown: Shutdown,
}

impl ServerInner {
    pub(crate) fn enter_dispatch(&self, idx: usize) {
        self.runtime[idx].inflight.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn exit_dispatch(&self, idx: usize) {
        self.runtime[idx].inflight.fetch_sub(1, Ordering::SeqCst);
        self.runtime[idx].throttle.notify_waiters();
    }

    /// Park the caller while the binding is over its admission limit.
    /// Connection cancellation unblocks it.
    pub(crate) async fn wait_throttle(&self, idx: usize, shutdown: &Shutdown) {
        let Some(limit) = self.bindings[idx].max_inflight else {
            return;
        };
        let rt = &self.runtime[idx];
        loop {
            // Register before checking, so a finishing dispatch between the
            // load and the await cannot be missed.
            let notified = rt.throttle.notified();
            if rt.inflight.load(Ordering::SeqCst) < limit {
                return;
            }
            tokio::select! {
                _ = notified => {}
                _ = shutdown.cancelled() => return,
            }
        }
    }

    pub(crate) async fn limit_close(&self, idx: usize) {
        if let Some(limiter) = &self.runtime[idx].close_limiter {
            limiter.take().await;
        }
    }

    pub(crate) fn bind_id(&self, idx: usize, id: &str, conn_id: u64) {
        self.runtime[idx].ids.lock().insert(id.to_string(), conn_id);
    }

    /// Drop the connection from the registry. Identity bindings are only
    /// removed when they still point at this connection.
    pub(crate) fn untrack(&self, idx: usize, conn_id: u64, id: &str) {
        self.conns.lock().remove(&conn_id);
        if !id.is_empty() {
            let mut ids = self.runtime[idx].ids.lock();
            if ids.get(id) == Some(&conn_id) {
                ids.remove(id);
            }
        }
    }

    fn track(&self, conn_id: u64, handle: ConnHandle) {
        self.conns.lock().insert(conn_id, handle);
    }
}

/// The transport server: one listen endpoint per [`ServerBinding`], each
/// accepting connections into the shared registry.
pub struct Server {
    inner: Arc<ServerInner>,
    listeners: Mutex<Vec<(usize, TcpListener)>>,
}

impl Server {
    pub fn new(bindings: Vec<ServerBinding>) -> Self {
        let bindings: Vec<Arc<ServerBinding>> = bindings.into_iter().map(Arc::new).collect();
        let runtime = bindings
            .iter()
            .map(|b| BindingRuntime {
                inflight: AtomicUsize::new(0),
                throttle: Notify::new(),
                ids: Mutex::new(HashMap::new()),
                close_limiter: b.max_close_per_sec.map(RateLimiter::new),
            })
            .collect();
        Self {
            inner: Arc::new(ServerInner {
                bindings,
                runtime,
                conns: Mutex::new(HashMap::new()),
                next_conn_id: AtomicU64::new(1),
                shutdown: Shutdown::new(),
            }),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Bind every configured endpoint and return the local addresses, in
    /// binding order. Useful with port 0.
    pub async fn listen(&self) -> Result<Vec<SocketAddr>, Error> {
        let mut listeners = Vec::new();
        let mut addrs = Vec::new();
        for (idx, binding) in self.inner.bindings.iter().enumerate() {
            let listener = TcpListener::bind(&binding.addr).await?;
            addrs.push(listener.local_addr()?);
            tracing::info!(addr = %addrs[idx], "listening");
            listeners.push((idx, listener));
        }
        *self.listeners.lock() = listeners;
        Ok(addrs)
    }

    /// Accept and serve connections until [`shutdown`](Self::shutdown) is
    /// called. Binds first if [`listen`](Self::listen) has not run.
    pub async fn serve(&self) -> Result<(), Error> {
        if self.listeners.lock().is_empty() {
            self.listen().await?;
        }
        let listeners = std::mem::take(&mut *self.listeners.lock());

        let mut accepts: JoinSet<()> = JoinSet::new();
        for (idx, listener) in listeners {
            accepts.spawn(accept_loop(self.inner.clone(), idx, listener));
        }

        self.inner.shutdown.cancelled().await;
        accepts.shutdown().await;

        let handles: Vec<ConnHandle> = self.inner.conns.lock().values().cloned().collect();
        for handle in handles {
            if let Err(e) = handle.close().await {
                tracing::debug!(error = %e, "close connection at shutdown");
            }
        }
        Ok(())
    }

    /// Stop accepting and tear down every tracked connection.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Find a live connection on `binding` by the identity it registered
    /// with [`ConnHandle::set_id`].
    pub fn connection(&self, binding: usize, id: &str) -> Option<ConnHandle> {
        let conn_id = *self.inner.runtime.get(binding)?.ids.lock().get(id)?;
        self.inner.conns.lock().get(&conn_id).cloned()
    }

    /// Number of currently tracked connections, across bindings.
    pub fn connection_count(&self) -> usize {
        self.inner.conns.lock().len()
    }
}

async fn accept_loop(inner: Arc<ServerInner>, idx: usize, listener: TcpListener) {
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((sock, peer)) => {
                    if let Err(e) = sock.set_nodelay(true) {
                        tracing::debug!(error = %e, "set_nodelay");
                    }
                    let conn_id = inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
                    let binding = inner.bindings[idx].clone();
                    let (shared, read_half) = ConnShared::new(
                        sock,
                        binding,
                        Arc::downgrade(&inner),
                        idx,
                        conn_id,
                        peer.to_string(),
                    );
                    inner.track(conn_id, ConnHandle { shared: shared.clone() });
                    tracing::debug!(remote = %peer, conn_id, "accepted connection");
                    tokio::spawn(conn::serve(shared, read_half));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            },
        }
    }
}
