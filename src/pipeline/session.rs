//! Device session: connection state machine and frame consumption loop
//!
//! A single worker thread owns the session. It repeatedly opens the device
//! (fixed timeout, fixed retry delay, no retry limit), streams until the
//! device goes away or the session itself decides to stop, tears down, and
//! starts looking for the device again.
//!
//! ```text
//!            open ok + start              DeviceDisconnected event
//! Disconnected ─────────────► Streaming ───────────────────────► Disconnected
//!      ▲   │ open failed          │ stall / shutdown (stop, close, settle)
//!      └───┘ retry delay          └───────────────────────────► Disconnected
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::utils::CachePadded;
use flume::{Receiver, Sender};
use tracing::{debug, error, info, instrument, trace, warn};

use super::dispatch::{CallbackRegistry, FrameDispatcher};
use super::events::StreamEventSink;
use super::queue::FrameHandoffQueue;
use crate::capture::{FrameBuffer, StreamHandle, StreamObserver, UvcDriver};
use crate::error::{Result, UvcError};
use crate::{Config, SessionConfig, StreamConfig};

/// Name of the session worker thread
pub const WORKER_NAME: &str = "frame_hdl";

/// Observable connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Streaming,
}

/// Connection flag shared between the session thread and driver threads.
///
/// Holds the id of the stream being consumed, 0 while disconnected. Ending a
/// stream is a compare-and-swap on that id, so exactly one side (event sink
/// or session) gets to end any given stream, and a late disconnect for an
/// old stream cannot end a newer one.
#[derive(Debug, Default)]
pub struct Connection {
    active: AtomicU64,
}

impl Connection {
    pub(crate) fn begin(&self, stream: StreamHandle) {
        self.active.store(stream.id(), Ordering::SeqCst);
    }

    /// Ends `stream` if it is the active one. Returns whether this call ended it.
    pub(crate) fn end(&self, stream: StreamHandle) -> bool {
        self.active
            .compare_exchange(stream.id(), 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn is_active(&self, stream: StreamHandle) -> bool {
        self.active.load(Ordering::SeqCst) == stream.id()
    }

    pub(crate) fn is_streaming(&self) -> bool {
        self.active.load(Ordering::SeqCst) != 0
    }

    pub fn state(&self) -> ConnectionState {
        if self.is_streaming() {
            ConnectionState::Streaming
        } else {
            ConnectionState::Disconnected
        }
    }
}

/// Lock-free counters updated from both the session and driver threads
#[derive(Default)]
pub(crate) struct SessionCounters {
    open_attempts: CachePadded<AtomicU64>,
    open_failures: CachePadded<AtomicU64>,
    connects: CachePadded<AtomicU64>,
    frames_dropped: CachePadded<AtomicU64>,
    frames_drained: CachePadded<AtomicU64>,
    transfer_errors: CachePadded<AtomicU64>,
    buffer_overflows: CachePadded<AtomicU64>,
    buffer_underflows: CachePadded<AtomicU64>,
    disconnects: CachePadded<AtomicU64>,
}

/// Point-in-time copy of the session counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub open_attempts: u64,
    pub open_failures: u64,
    pub connects: u64,
    pub frames_dispatched: u64,
    /// Rejected at push time because the queue was full
    pub frames_dropped: u64,
    /// Returned undelivered because their stream had ended
    pub frames_drained: u64,
    pub transfer_errors: u64,
    pub buffer_overflows: u64,
    pub buffer_underflows: u64,
    pub disconnects: u64,
}

impl SessionCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_drop(&self) {
        Self::bump(&self.frames_dropped);
        metrics::counter!("uvcstream_frames_dropped_total").increment(1);
    }

    pub(crate) fn record_transfer_error(&self) {
        Self::bump(&self.transfer_errors);
    }

    pub(crate) fn record_overflow(&self) {
        Self::bump(&self.buffer_overflows);
    }

    pub(crate) fn record_underflow(&self) {
        Self::bump(&self.buffer_underflows);
    }

    pub(crate) fn record_disconnect(&self) {
        Self::bump(&self.disconnects);
    }

    /// Everything but `frames_dispatched`, which the dispatcher counts
    pub(crate) fn snapshot(&self) -> SessionStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        SessionStats {
            open_attempts: load(&self.open_attempts),
            open_failures: load(&self.open_failures),
            connects: load(&self.connects),
            frames_dispatched: 0,
            frames_dropped: load(&self.frames_dropped),
            frames_drained: load(&self.frames_drained),
            transfer_errors: load(&self.transfer_errors),
            buffer_overflows: load(&self.buffer_overflows),
            buffer_underflows: load(&self.buffer_underflows),
            disconnects: load(&self.disconnects),
        }
    }
}

/// Why the consumption loop left `Streaming`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamExit {
    /// The driver announced the device is gone
    Disconnected,
    /// No frame arrived for `stall_timeouts` consecutive queue waits
    Stalled,
    /// `start` failed right after a successful open
    StartFailed,
    Shutdown,
}

/// State shared between a running session and its handle
struct Shared {
    connection: Arc<Connection>,
    counters: Arc<SessionCounters>,
    dispatcher: FrameDispatcher,
    queue: Arc<FrameHandoffQueue>,
    shutdown: AtomicBool,
}

/// A single logical camera connection
pub struct DeviceSession {
    stream_config: StreamConfig,
    config: SessionConfig,
    driver: Arc<dyn UvcDriver>,
    observer: Arc<dyn StreamObserver>,
    shared: Arc<Shared>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

impl DeviceSession {
    /// Builds a session; nothing touches the driver until it runs.
    ///
    /// The hand-off queue is created here, once, and lives as long as the
    /// session does.
    pub fn new(
        config: &Config,
        driver: Arc<dyn UvcDriver>,
        registry: Arc<CallbackRegistry>,
    ) -> Self {
        let queue = Arc::new(FrameHandoffQueue::new(config.session.queue_capacity));
        let connection = Arc::new(Connection::default());
        let counters = Arc::new(SessionCounters::default());

        let observer: Arc<dyn StreamObserver> = Arc::new(StreamEventSink::new(
            Arc::clone(&queue),
            Arc::clone(&connection),
            Arc::clone(&counters),
            Arc::clone(&driver),
        ));
        let dispatcher = FrameDispatcher::new(registry, Arc::clone(&driver));
        let (wake_tx, wake_rx) = flume::bounded(1);

        Self {
            stream_config: config.stream.clone(),
            config: config.session.clone(),
            driver,
            observer,
            shared: Arc::new(Shared {
                connection,
                counters,
                dispatcher,
                queue,
                shutdown: AtomicBool::new(false),
            }),
            wake_tx,
            wake_rx,
        }
    }

    /// Moves the session onto its own worker thread.
    pub fn spawn(self) -> Result<SessionHandle> {
        let shared = Arc::clone(&self.shared);
        let wake = self.wake_tx.clone();
        let thread = thread::Builder::new()
            .name(WORKER_NAME.into())
            .spawn(move || self.run())?;

        Ok(SessionHandle {
            shared,
            wake,
            thread: Some(thread),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.connection.state()
    }

    /// Runs the session on the calling thread until shutdown is requested.
    pub fn run(&self) {
        info!(capacity = self.shared.queue.capacity(), "Session worker started");

        while !self.stopping() {
            let Some(stream) = self.connect() else {
                self.pause(self.config.retry_delay());
                continue;
            };

            let exit = self.consume(stream);
            self.teardown(stream, exit);
        }

        info!("Session worker exiting");
    }

    /// One bounded-time attempt to open and start the device.
    #[instrument(skip(self))]
    fn connect(&self) -> Option<StreamHandle> {
        let counters = &self.shared.counters;
        SessionCounters::bump(&counters.open_attempts);
        info!("Looking for UVC camera...");

        let stream = match self.driver.open(
            &self.stream_config,
            Arc::clone(&self.observer),
            self.config.open_timeout(),
        ) {
            Ok(stream) => stream,
            Err(e) => {
                SessionCounters::bump(&counters.open_failures);
                if e.is_recoverable() {
                    info!("Failed to open device: {}", e);
                } else {
                    error!("Failed to open device: {}", e);
                }
                return None;
            }
        };

        SessionCounters::bump(&counters.connects);
        self.shared.connection.begin(stream);
        metrics::gauge!("uvcstream_connected").set(1.0);
        info!(%stream, "Camera connected! Starting stream...");
        Some(stream)
    }

    /// Consumes frames of `stream` until it stops being the active stream.
    fn consume(&self, stream: StreamHandle) -> StreamExit {
        let shared = &self.shared;

        self.pause(self.config.start_delay());
        if !shared.connection.is_active(stream) {
            return StreamExit::Disconnected;
        }
        if let Err(e) = self.driver.start(stream) {
            error!(%stream, "Failed to start stream: {}", e);
            return StreamExit::StartFailed;
        }

        let wait = self.config.queue_wait();
        let mut idle_waits = 0u32;
        loop {
            if !shared.connection.is_active(stream) {
                return StreamExit::Disconnected;
            }
            if self.stopping() {
                return StreamExit::Shutdown;
            }

            let Some(frame) = shared.queue.pop_timeout(wait) else {
                idle_waits = idle_waits.saturating_add(1);
                trace!(%stream, idle_waits, "No frame within queue wait");
                if self.config.stall_timeouts.is_some_and(|limit| idle_waits >= limit) {
                    warn!(%stream, idle_waits, "Stream stalled without a disconnect");
                    return StreamExit::Stalled;
                }
                continue;
            };
            idle_waits = 0;

            if frame.stream() == stream && shared.connection.is_active(stream) {
                shared.dispatcher.dispatch(frame);
            } else {
                self.drain_one(frame);
            }
        }
    }

    /// Leaves `Streaming` and gets the driver ready for the next open.
    fn teardown(&self, stream: StreamHandle, exit: StreamExit) {
        let shared = &self.shared;
        // Whoever ends the stream first decides who tears it down
        let external = exit == StreamExit::Disconnected || !shared.connection.end(stream);
        metrics::gauge!("uvcstream_connected").set(0.0);

        if external {
            info!(%stream, "Device disconnected");
        } else {
            info!(%stream, reason = ?exit, "Stream stop");
            if exit != StreamExit::StartFailed {
                if let Err(e) = self.driver.stop(stream) {
                    warn!(%stream, "Failed to stop stream: {}", e);
                }
            }
            if let Err(e) = self.driver.close(stream) {
                warn!(%stream, "Failed to close stream: {}", e);
            }
        }

        // The driver produces nothing more for this stream by now
        for frame in shared.queue.drain() {
            self.drain_one(frame);
        }

        if !external {
            self.pause(self.config.settle_delay());
        }
    }

    fn drain_one(&self, frame: FrameBuffer) {
        debug!(
            sequence = frame.sequence(),
            stream = %frame.stream(),
            "Returning undelivered frame"
        );
        SessionCounters::bump(&self.shared.counters.frames_drained);
        self.shared.dispatcher.release(frame);
    }

    fn stopping(&self) -> bool {
        self.shared.shutdown.load(Ordering::SeqCst)
    }

    /// Sleeps for `duration`, waking early on shutdown.
    fn pause(&self, duration: Duration) {
        if duration.is_zero() || self.stopping() {
            return;
        }
        // The session keeps its own sender, so this never disconnects
        let _ = self.wake_rx.recv_timeout(duration);
    }
}

/// Handle to a session running on its worker thread.
///
/// Dropping the handle detaches the worker; it keeps running.
pub struct SessionHandle {
    shared: Arc<Shared>,
    wake: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl SessionHandle {
    pub fn state(&self) -> ConnectionState {
        self.shared.connection.state()
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            frames_dispatched: self.shared.dispatcher.delivered(),
            ..self.shared.counters.snapshot()
        }
    }

    pub fn registry(&self) -> &Arc<CallbackRegistry> {
        self.shared.dispatcher.registry()
    }

    /// Frames currently waiting in the hand-off queue
    pub fn queued(&self) -> usize {
        self.shared.queue.len()
    }

    /// Asks the worker to stop and waits for it.
    ///
    /// A stream still running is stopped and closed first. The worker notices
    /// within one queue wait at most.
    pub fn shutdown(mut self) -> Result<()> {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        let _ = self.wake.try_send(());
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| UvcError::Device("session worker panicked".into())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{MockDriver, StreamEvent};
    use tracing_test::traced_test;

    fn fast_config() -> Config {
        let mut config = Config::default();
        config.session.open_timeout_ms = 10;
        config.session.retry_delay_ms = 10;
        config.session.settle_delay_ms = 10;
        config.session.start_delay_ms = 0;
        config.session.queue_wait_ms = 10;
        config
    }

    fn session(driver: &MockDriver) -> DeviceSession {
        DeviceSession::new(
            &fast_config(),
            Arc::new(driver.clone()),
            Arc::new(CallbackRegistry::new()),
        )
    }

    #[test]
    #[traced_test]
    fn failed_open_stays_disconnected() {
        let driver = MockDriver::failing_opens(1);
        let session = session(&driver);

        assert!(session.connect().is_none());
        assert_eq!(session.state(), ConnectionState::Disconnected);
        let stats = session.shared.counters.snapshot();
        assert_eq!(stats.open_attempts, 1);
        assert_eq!(stats.open_failures, 1);
        assert!(logs_contain("Looking for UVC camera..."));
        assert!(logs_contain("Failed to open device"));
    }

    #[test]
    #[traced_test]
    fn self_initiated_stop_stops_and_closes() {
        let driver = MockDriver::new();
        let session = session(&driver);

        let stream = session.connect().unwrap();
        assert_eq!(session.state(), ConnectionState::Streaming);
        assert!(logs_contain("Camera connected! Starting stream..."));

        session.teardown(stream, StreamExit::Stalled);
        assert_eq!(session.state(), ConnectionState::Disconnected);
        let counters = driver.counters();
        assert_eq!(counters.stops, 1);
        assert_eq!(counters.closes, 1);
        assert!(logs_contain("Stream stop"));
    }

    #[test]
    fn failed_start_closes_without_stop() {
        let driver = MockDriver::new();
        let session = session(&driver);

        let stream = session.connect().unwrap();
        session.teardown(stream, StreamExit::StartFailed);
        let counters = driver.counters();
        assert_eq!(counters.stops, 0);
        assert_eq!(counters.closes, 1);
    }

    #[test]
    #[traced_test]
    fn external_disconnect_is_not_torn_down_twice() {
        let driver = MockDriver::new();
        let session = session(&driver);

        let stream = session.connect().unwrap();
        assert!(driver.emit_event(|stream| StreamEvent::DeviceDisconnected { stream }));
        assert_eq!(session.consume(stream), StreamExit::Disconnected);

        session.teardown(stream, StreamExit::Disconnected);
        let counters = driver.counters();
        assert_eq!(counters.stops, 0);
        assert_eq!(counters.closes, 1);
        assert!(logs_contain("Device disconnected"));
    }

    #[test]
    fn stall_watchdog_gives_up_after_idle_waits() {
        let driver = MockDriver::new();
        let mut config = fast_config();
        config.session.stall_timeouts = Some(2);
        let session = DeviceSession::new(
            &config,
            Arc::new(driver.clone()),
            Arc::new(CallbackRegistry::new()),
        );

        let stream = session.connect().unwrap();
        assert_eq!(session.consume(stream), StreamExit::Stalled);
        assert!(driver.is_started());
    }

    #[test]
    fn teardown_returns_queued_frames() {
        let driver = MockDriver::new();
        let session = session(&driver);

        let stream = session.connect().unwrap();
        driver.start(stream).unwrap();
        let sequences: Vec<u64> = (0..2).map(|_| driver.emit_frame(b"frame").0).collect();
        assert_eq!(session.shared.queue.len(), 2);

        session.teardown(stream, StreamExit::Shutdown);
        assert!(session.shared.queue.is_empty());
        for sequence in sequences {
            assert_eq!(driver.return_count(sequence), 1);
        }
        assert_eq!(session.shared.counters.snapshot().frames_drained, 2);
        assert!(driver.all_returned_once());
    }
}
