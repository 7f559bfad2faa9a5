//! Per-connection stream table.
//!
//! A stream is all frames sharing one request id on one connection, with
//! independent open/closed state per direction. The table is the single
//! source of truth for "is this stream still open in direction X": both the
//! reader and the writer paths consult it, and all mutations are serialized
//! by its internal locks.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::flags::FrameFlags;

#[derive(Debug, Default)]
struct StreamState {
    /// We will not emit more frames on this stream.
    self_closed: bool,
    /// The peer will not emit more frames on this stream.
    peer_closed: bool,
}

/// State for one request id on one connection.
///
/// Created on the first inbound or outbound frame for the id (push frames
/// excepted), closed per direction by `END_STREAM` or `RST`, destroyed once
/// both directions are closed or the connection goes away.
#[derive(Debug)]
pub struct Stream {
    created_at: Instant,
    state: Mutex<StreamState>,
}

impl Stream {
    fn new() -> Self {
        Self {
            created_at: Instant::now(),
            state: Mutex::new(StreamState::default()),
        }
    }

    /// Whether we have closed our sending direction.
    pub fn is_self_closed(&self) -> bool {
        self.state.lock().self_closed
    }

    /// Whether the peer has closed its sending direction.
    pub fn is_peer_closed(&self) -> bool {
        self.state.lock().peer_closed
    }

    /// Time since the stream was created.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    fn force_close(&self) {
        let mut st = self.state.lock();
        st.self_closed = true;
        st.peer_closed = true;
    }
}

/// The map from request identifier to stream state.
#[derive(Debug, Default)]
pub(crate) struct ConnStreams {
    streams: Mutex<HashMap<u64, Arc<Stream>>>,
}

impl ConnStreams {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Return the stream for `request_id`, creating it if absent. The
    /// second element is `true` when the stream already existed; exactly
    /// one of two concurrent creators observes `false`.
    pub(crate) fn create_or_get(&self, request_id: u64, _flags: FrameFlags) -> (Arc<Stream>, bool) {
        match self.streams.lock().entry(request_id) {
            Entry::Occupied(e) => (e.get().clone(), true),
            Entry::Vacant(v) => {
                let s = Arc::new(Stream::new());
                v.insert(s.clone());
                (s, false)
            }
        }
    }

    /// Lookup without create.
    pub(crate) fn get(&self, request_id: u64) -> Option<Arc<Stream>> {
        self.streams.lock().get(&request_id).cloned()
    }

    /// Record an outbound frame about to go on the wire.
    ///
    /// Returns `false` when the frame must not be sent: the stream has
    /// already self-closed. The caller drops `RST` frames silently in that
    /// case and reports a write-after-self-close error for anything else.
    ///
    /// A stream reset in either direction stays in the table as a
    /// tombstone until the connection releases it, so a repeated reset
    /// still finds it and drops silently, and frames racing the reset are
    /// absorbed. Only a clean close (`END_STREAM` seen in both directions)
    /// destroys the entry.
    pub(crate) fn add_out_frame(
        &self,
        stream: &Arc<Stream>,
        request_id: u64,
        flags: FrameFlags,
    ) -> bool {
        let (admitted, done) = {
            let mut st = stream.state.lock();
            if st.self_closed {
                (false, false)
            } else if flags.is_rst() {
                st.self_closed = true;
                st.peer_closed = true;
                (true, false)
            } else {
                if flags.is_end_stream() {
                    st.self_closed = true;
                }
                (true, st.self_closed && st.peer_closed)
            }
        };
        if done {
            self.remove(request_id, stream);
        }
        admitted
    }

    /// Record an inbound frame observed by the reader.
    ///
    /// Returns `false` when the peer's sending direction is already
    /// closed; the reader drops such frames without dispatching them.
    pub(crate) fn add_in_frame(
        &self,
        stream: &Arc<Stream>,
        request_id: u64,
        flags: FrameFlags,
    ) -> bool {
        let (admitted, done) = {
            let mut st = stream.state.lock();
            if st.peer_closed {
                (false, false)
            } else if flags.is_rst() {
                st.self_closed = true;
                st.peer_closed = true;
                (true, false)
            } else {
                if flags.is_end_stream() {
                    st.peer_closed = true;
                }
                (true, st.self_closed && st.peer_closed)
            }
        };
        if done {
            self.remove(request_id, stream);
        }
        admitted
    }

    /// Close every stream and drop the table contents. Called on
    /// connection teardown.
    pub(crate) fn release(&self) {
        let drained: Vec<Arc<Stream>> = self.streams.lock().drain().map(|(_, s)| s).collect();
        for s in &drained {
            s.force_close();
        }
    }

    fn remove(&self, request_id: u64, stream: &Arc<Stream>) {
        let mut map = self.streams.lock();
        // A fresh stream may have been created under the same id meanwhile;
        // only remove the entry we were asked about.
        if let Some(cur) = map.get(&request_id) {
            if Arc::ptr_eq(cur, stream) {
                map.remove(&request_id);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.streams.lock().len()
    }
}
