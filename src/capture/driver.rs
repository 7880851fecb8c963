//! Boundary between the capture pipeline and a UVC driver

use std::sync::Arc;
use std::time::Duration;

use super::frame::{FrameBuffer, FrameDisposition, StreamEvent, StreamHandle};
use crate::error::Result;
use crate::StreamConfig;

/// Receives frames and events from a driver's transfer context.
///
/// Both methods run on driver threads and must return quickly. `on_frame`
/// in particular must never block: it runs where the driver cannot afford
/// to wait.
pub trait StreamObserver: Send + Sync {
    /// Offered every completed capture.
    fn on_frame(&self, frame: FrameBuffer) -> FrameDisposition;

    /// Offered every out-of-band event, once per occurrence.
    fn on_event(&self, event: StreamEvent);
}

/// A UVC driver able to serve one stream at a time.
///
/// Every buffer a driver hands to `StreamObserver::on_frame` must come back
/// exactly once, either as `FrameDisposition::Consumed` or through
/// `return_buffer`. Returning a buffer of a stream that is already closed is
/// allowed; the driver simply discards it.
pub trait UvcDriver: Send + Sync {
    /// Waits up to `timeout` for a device matching `config` and opens it.
    fn open(
        &self,
        config: &StreamConfig,
        observer: Arc<dyn StreamObserver>,
        timeout: Duration,
    ) -> Result<StreamHandle>;

    fn start(&self, stream: StreamHandle) -> Result<()>;

    fn stop(&self, stream: StreamHandle) -> Result<()>;

    /// Releases the stream. Callable from the observer's `on_event` for the
    /// disconnect that announced the stream's end.
    fn close(&self, stream: StreamHandle) -> Result<()>;

    fn return_buffer(&self, stream: StreamHandle, frame: FrameBuffer);
}
