//! Per-binding server configuration.

use std::sync::Arc;
use std::time::Duration;

use crate::frame::DEFAULT_MAX_FRAME_SIZE;
use crate::handler::Handler;
use crate::metrics::{CounterMetric, LatencyMetric};

/// Configuration for one listen endpoint of a [`Server`](crate::Server).
///
/// Zero values mean "use the default": a `max_frame_size` of 0 selects the
/// 10 MiB default, a `read_frame_ch_size` of 0 selects a rendezvous-depth
/// inbound channel.
pub struct ServerBinding {
    /// Listen address, e.g. `"127.0.0.1:8888"`.
    pub addr: String,
    /// Handler invoked for every dispatched request frame.
    pub handler: Arc<dyn Handler>,
    /// Per-frame read timeout for the connection's reader.
    pub default_read_timeout: Option<Duration>,
    /// Per-frame write timeout for the connection's writer.
    pub default_write_timeout: Option<Duration>,
    /// Maximum total frame size in bytes; 0 selects the default.
    pub max_frame_size: usize,
    /// Inbound channel depth between the reader task and the serve loop.
    pub read_frame_ch_size: usize,
    /// Optional counter sink for dispatch and failure accounting.
    pub counter_metric: Option<Arc<dyn CounterMetric>>,
    /// Optional latency sink for handler timing.
    pub latency_metric: Option<Arc<dyn LatencyMetric>>,
    /// When true, network errors are reported to the metric sinks under a
    /// generic label instead of the raw error string.
    pub overlay_network: bool,
    /// Admission limit: the reader task pauses while this many dispatches
    /// are in flight on the binding.
    pub max_inflight: Option<usize>,
    /// Rate limit applied to connection closes, per second.
    pub max_close_per_sec: Option<u32>,
}

impl ServerBinding {
    /// A binding with the given address and handler and default everything
    /// else.
    pub fn new(addr: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        Self {
            addr: addr.into(),
            handler,
            default_read_timeout: None,
            default_write_timeout: None,
            max_frame_size: 0,
            read_frame_ch_size: 0,
            counter_metric: None,
            latency_metric: None,
            overlay_network: false,
            max_inflight: None,
            max_close_per_sec: None,
        }
    }

    /// The effective frame-size bound for this binding.
    pub(crate) fn effective_max_frame_size(&self) -> usize {
        if self.max_frame_size > 0 {
            self.max_frame_size
        } else {
            DEFAULT_MAX_FRAME_SIZE
        }
    }
}

impl std::fmt::Debug for ServerBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerBinding")
            .field("addr", &self.addr)
            .field("default_read_timeout", &self.default_read_timeout)
            .field("default_write_timeout", &self.default_write_timeout)
            .field("max_frame_size", &self.max_frame_size)
            .field("read_frame_ch_size", &self.read_frame_ch_size)
            .field("overlay_network", &self.overlay_network)
            .field("max_inflight", &self.max_inflight)
            .field("max_close_per_sec", &self.max_close_per_sec)
            .finish_non_exhaustive()
    }
}
