//! Delivery of dequeued frames to the registered sink

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tracing::{debug, error, info, trace};

use crate::capture::{FrameBuffer, UvcDriver};
use crate::error::{Result, UvcError};

/// Downstream consumer of frame bytes.
///
/// Called synchronously on the session thread. The slice is only valid for
/// the duration of the call: the buffer goes back to the driver right after.
pub trait FrameSink: Send + Sync {
    fn on_frame(&self, data: &[u8]);
}

impl<F> FrameSink for F
where
    F: Fn(&[u8]) + Send + Sync,
{
    fn on_frame(&self, data: &[u8]) {
        self(data)
    }
}

/// Plain function callback, paired with the context it is invoked with
pub type FrameCallback<C> = fn(&[u8], &C);

struct CallbackSink<C> {
    callback: FrameCallback<C>,
    context: C,
}

impl<C: Send + Sync> FrameSink for CallbackSink<C> {
    fn on_frame(&self, data: &[u8]) {
        (self.callback)(data, &self.context)
    }
}

struct Registration {
    sink: Box<dyn FrameSink>,
}

/// Single-slot holder of the active frame sink.
///
/// Replacing the sink is an atomic pointer swap, so it can happen at any
/// time, including mid-stream; the next dequeued frame sees the new sink.
#[derive(Default)]
pub struct CallbackRegistry {
    slot: ArcSwapOption<Registration>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `sink`, replacing any previous registration.
    pub fn register(&self, sink: impl FrameSink + 'static) {
        self.slot.store(Some(Arc::new(Registration {
            sink: Box::new(sink),
        })));
        info!("Frame callback registered");
    }

    /// Installs a function + context pair.
    ///
    /// Fails with `InvalidArgument` when `callback` is absent, leaving any
    /// earlier registration in place.
    pub fn register_callback<C>(
        &self,
        callback: Option<FrameCallback<C>>,
        context: C,
    ) -> Result<()>
    where
        C: Send + Sync + 'static,
    {
        let Some(callback) = callback else {
            error!("Frame callback cannot be empty");
            return Err(UvcError::InvalidArgument("frame callback cannot be empty"));
        };
        self.register(CallbackSink { callback, context });
        Ok(())
    }

    /// Removes the registration; frames are then drained without delivery.
    pub fn clear(&self) {
        self.slot.store(None);
    }

    pub fn is_registered(&self) -> bool {
        self.slot.load().is_some()
    }

    /// Runs the current sink, if any, on `data`. Returns whether one ran.
    fn deliver(&self, data: &[u8]) -> bool {
        match self.slot.load_full() {
            Some(registration) => {
                registration.sink.on_frame(data);
                true
            }
            None => false,
        }
    }
}

/// Hands each dequeued frame to the registered sink, then back to the driver.
pub struct FrameDispatcher {
    registry: Arc<CallbackRegistry>,
    driver: Arc<dyn UvcDriver>,
    delivered: AtomicU64,
    returned: AtomicU64,
}

impl FrameDispatcher {
    pub fn new(registry: Arc<CallbackRegistry>, driver: Arc<dyn UvcDriver>) -> Self {
        Self {
            registry,
            driver,
            delivered: AtomicU64::new(0),
            returned: AtomicU64::new(0),
        }
    }

    /// Delivers `frame` and returns its buffer to the stream that lent it.
    ///
    /// The return happens on every path, including a panicking sink.
    pub fn dispatch(&self, frame: FrameBuffer) {
        trace!(sequence = frame.sequence(), len = frame.len(), "Dispatching frame");

        let outcome =
            panic::catch_unwind(AssertUnwindSafe(|| self.registry.deliver(frame.data())));
        let sequence = frame.sequence();
        self.release(frame);

        match outcome {
            Ok(true) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("uvcstream_frames_dispatched_total").increment(1);
            }
            Ok(false) => debug!(sequence, "No frame callback registered, frame dropped"),
            Err(_) => error!(sequence, "Frame callback panicked"),
        }
    }

    /// Returns `frame` to its stream without delivering it.
    pub fn release(&self, frame: FrameBuffer) {
        self.driver.return_buffer(frame.stream(), frame);
        self.returned.fetch_add(1, Ordering::Relaxed);
    }

    /// Frames the sink actually received
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Buffers given back to the driver
    pub fn returned(&self) -> u64 {
        self.returned.load(Ordering::Relaxed)
    }

    pub fn registry(&self) -> &Arc<CallbackRegistry> {
        &self.registry
    }
}
