//! Per-connection shared info: identity, user slot, close notification,
//! and the pending-response table for server-initiated requests.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::Error;
use crate::frame::Frame;

/// How many times the weak request-id allocator probes before giving up.
/// The id space is large enough that three probes is overwhelmingly
/// sufficient.
const UUID_PROBES: usize = 3;

type CloseNotify = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct InfoInner {
    closed: bool,
    id: String,
    close_notify: Vec<CloseNotify>,
    respes: HashMap<u64, oneshot::Sender<Frame>>,
    anything: Option<Arc<dyn Any + Send + Sync>>,
}

/// Mutable per-connection record, shared with handlers through the request
/// frame. All access is internally serialized; close-notify callbacks run
/// outside the lock.
#[derive(Default)]
pub struct ConnectionInfo {
    inner: Mutex<InfoInner>,
}

impl ConnectionInfo {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// The opaque user slot.
    pub fn get_anything(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.inner.lock().anything.clone()
    }

    /// Set the opaque user slot.
    pub fn set_anything(&self, anything: Arc<dyn Any + Send + Sync>) {
        self.inner.lock().anything = Some(anything);
    }

    /// The connection identity, empty until set.
    pub fn get_id(&self) -> String {
        self.inner.lock().id.clone()
    }

    /// Set the identity. May be called at most once, with a non-empty
    /// value; violating either is a programming error.
    ///
    /// # Panics
    ///
    /// Panics on an empty id or a second call.
    pub(crate) fn set_id_once(&self, id: &str) {
        assert!(!id.is_empty(), "empty connection id not allowed");
        let mut inner = self.inner.lock();
        assert!(inner.id.is_empty(), "connection id set twice");
        inner.id = id.to_string();
    }

    /// Run `f` when the connection closes. If it is already closed, `f`
    /// runs immediately on the calling task, outside the lock.
    pub fn notify_when_close(&self, f: impl FnOnce() + Send + 'static) {
        {
            let mut inner = self.inner.lock();
            if !inner.closed {
                inner.close_notify.push(Box::new(f));
                return;
            }
        }
        f();
    }

    /// Whether the connection has been marked closed.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Allocate a pending-response slot under a fresh weak-unique id.
    pub(crate) fn register_response(&self) -> Result<(u64, Response), Error> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(Error::ConnAlreadyClosed);
        }
        let mut request_id = rand::random::<u64>();
        let mut found = false;
        for i in 0.. {
            if !inner.respes.contains_key(&request_id) {
                found = true;
                break;
            }
            if i + 1 >= UUID_PROBES {
                break;
            }
            request_id = rand::random::<u64>();
        }
        if !found {
            return Err(Error::NoNewUuid);
        }
        let (tx, rx) = oneshot::channel();
        inner.respes.insert(request_id, tx);
        Ok((request_id, Response { rx }))
    }

    /// Remove and return the pending slot for `request_id`, if any.
    pub(crate) fn take_pending(&self, request_id: u64) -> Option<oneshot::Sender<Frame>> {
        self.inner.lock().respes.remove(&request_id)
    }

    /// Drop the pending slot for `request_id`; its mailbox observes
    /// end-of-stream.
    pub(crate) fn remove_pending(&self, request_id: u64) {
        self.inner.lock().respes.remove(&request_id);
    }

    /// Mark the connection closed, closing every pending-response mailbox,
    /// and return the close-notify list for the caller to run outside the
    /// lock.
    pub(crate) fn mark_closed(&self) -> Vec<CloseNotify> {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.respes.clear();
        std::mem::take(&mut inner.close_notify)
    }
}

/// Receive handle for the reply to a server-initiated request.
///
/// The mailbox holds at most one frame. It resolves to `None` when the
/// connection closes before a reply arrives or the caller's slot was
/// dropped.
pub struct Response {
    rx: oneshot::Receiver<Frame>,
}

impl Response {
    /// Wait for the reply frame.
    pub async fn recv(self) -> Option<Frame> {
        self.rx.await.ok()
    }
}
