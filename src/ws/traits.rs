//! Seams between the connection manager and the feed layer.

use std::sync::Arc;

use crate::feed::types::request::ControlFrame;

/// Receives transport events from a [`ConnectionManager`](super::ConnectionManager).
///
/// Both hooks run on the connection task, so frames are seen in the order the
/// transport delivers them and `on_open` completes before any frame of the
/// new connection is handed to `on_frame`.
pub trait Handler: Send + Sync + 'static {
    /// Called after the transport opens, before pending `connect()` calls resolve.
    ///
    /// Frames written to `sink` here are the first frames of the connection.
    fn on_open(&self, sink: &dyn FrameSink);

    /// Called for every text frame received.
    fn on_frame(&self, text: &str);
}

impl<H: Handler> Handler for Arc<H> {
    fn on_open(&self, sink: &dyn FrameSink) {
        (**self).on_open(sink);
    }

    fn on_frame(&self, text: &str) {
        (**self).on_frame(text);
    }
}

/// Identifies one open transport. Each open gets a new id.
pub type TransportId = u64;

/// Destination for outbound control frames.
///
/// Implementations never fail loudly: a frame that cannot be written right now
/// is dropped, since subscriptions are replayed on the next open.
pub trait FrameSink {
    /// Write `frame`. Returns the transport it was queued on, or `None` if it was dropped.
    fn send(&self, frame: &ControlFrame) -> Option<TransportId>;

    /// The transport frames are currently written to, if one is open.
    fn transport(&self) -> Option<TransportId>;
}
