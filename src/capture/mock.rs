//! In-process driver with scriptable behaviour
//!
//! Stands in for real hardware in tests and in the synthetic source of the
//! binary. The calling thread of `emit_frame`/`emit_event` plays the part of
//! the driver's transfer context.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info};

use super::driver::{StreamObserver, UvcDriver};
use super::frame::{FrameBuffer, FrameDisposition, StreamEvent, StreamHandle};
use super::pool::FrameBufferPool;
use crate::error::{Result, UvcError};
use crate::StreamConfig;

/// Buffer size used when the config leaves it to negotiation
const DEFAULT_FRAME_SIZE: usize = 64 * 1024;

/// What happened to a frame offered through `emit_frame`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emitted {
    /// The observer took ownership
    HandedOff,
    /// The observer declined and the buffer went straight back to the pool
    Reclaimed,
    /// The pool was empty; an underflow event was raised
    Underflow,
    /// The payload did not fit a buffer; an overflow event was raised
    Overflow,
    /// No stream is started
    NotStreaming,
}

/// Call counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MockCounters {
    pub opens: usize,
    pub failed_opens: usize,
    pub starts: usize,
    pub stops: usize,
    pub closes: usize,
    /// Buffers given back through `return_buffer`
    pub returns: usize,
    /// Buffers the observer declined at push time
    pub reclaims: usize,
}

struct ActiveStream {
    handle: StreamHandle,
    observer: Arc<dyn StreamObserver>,
    pool: Arc<FrameBufferPool>,
    started: bool,
}

#[derive(Default)]
struct State {
    active: Option<ActiveStream>,
    /// Pools of closed streams whose buffers may still be out
    retired: HashMap<StreamHandle, Arc<FrameBufferPool>>,
    counters: MockCounters,
    /// Sequence number -> times its buffer came back
    returned: HashMap<u64, usize>,
    /// Open calls still to fail before one succeeds
    failures_left: usize,
}

struct Generator {
    running: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

struct Shared {
    state: Mutex<State>,
    next_stream: AtomicU64,
    next_sequence: AtomicU64,
    emitted: AtomicUsize,
    generator: Mutex<Option<Generator>>,
    generator_fps: Option<u32>,
}

/// Scriptable driver; clones share the same device
#[derive(Clone)]
pub struct MockDriver {
    shared: Arc<Shared>,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    pub fn new() -> Self {
        Self::build(0, None)
    }

    /// Driver whose first `count` opens fail with `OpenTimeout`
    pub fn failing_opens(count: usize) -> Self {
        Self::build(count, None)
    }

    /// Driver that produces sequence-tagged frames on its own at `fps` while started
    pub fn synthetic(fps: u32) -> Self {
        Self::build(0, Some(fps.max(1)))
    }

    fn build(failures: usize, generator_fps: Option<u32>) -> Self {
        let state = State {
            failures_left: failures,
            ..State::default()
        };
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                next_stream: AtomicU64::new(1),
                next_sequence: AtomicU64::new(1),
                emitted: AtomicUsize::new(0),
                generator: Mutex::new(None),
                generator_fps,
            }),
        }
    }

    /// Offers a frame carrying `payload`, exactly as a transfer completion would.
    ///
    /// Returns the sequence number stamped on the frame alongside the outcome.
    pub fn emit_frame(&self, payload: &[u8]) -> (u64, Emitted) {
        self.shared.emit_frame(payload)
    }

    /// Raises the event built by `make` against the active stream.
    ///
    /// A disconnect marks the stream stopped before the observer hears of it,
    /// the way a driver tears down its side first. Returns `false` when no
    /// stream is open.
    pub fn emit_event(&self, make: impl FnOnce(StreamHandle) -> StreamEvent) -> bool {
        let (event, observer) = {
            let mut state = self.shared.lock();
            let Some(active) = state.active.as_mut() else {
                return false;
            };
            let event = make(active.handle);
            if matches!(event, StreamEvent::DeviceDisconnected { .. }) {
                active.started = false;
            }
            (event, Arc::clone(&active.observer))
        };
        if matches!(event, StreamEvent::DeviceDisconnected { .. }) {
            self.shared.stop_generator();
        }
        observer.on_event(event);
        true
    }

    pub fn counters(&self) -> MockCounters {
        self.shared.lock().counters
    }

    /// How many times the buffer carrying `sequence` came back
    pub fn return_count(&self, sequence: u64) -> usize {
        self.shared.lock().returned.get(&sequence).copied().unwrap_or(0)
    }

    /// Frames successfully filled and offered to the observer
    pub fn emitted(&self) -> usize {
        self.shared.emitted.load(Ordering::Relaxed)
    }

    /// Every offered frame has come back exactly once
    pub fn all_returned_once(&self) -> bool {
        let state = self.shared.lock();
        state.returned.len() == self.emitted() && state.returned.values().all(|&n| n == 1)
    }

    pub fn active_stream(&self) -> Option<StreamHandle> {
        self.shared.lock().active.as_ref().map(|active| active.handle)
    }

    pub fn is_started(&self) -> bool {
        self.shared
            .lock()
            .active
            .as_ref()
            .is_some_and(|active| active.started)
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        // A panicking test thread must not wedge every later assertion
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit_frame(&self, payload: &[u8]) -> (u64, Emitted) {
        let (handle, observer, pool) = {
            let state = self.lock();
            match &state.active {
                Some(active) if active.started => (
                    active.handle,
                    Arc::clone(&active.observer),
                    Arc::clone(&active.pool),
                ),
                _ => return (0, Emitted::NotStreaming),
            }
        };

        // Observer calls happen without the lock held, like a transfer
        // completion calling out of the driver
        let Some(mut frame) = pool.lend(handle) else {
            observer.on_event(StreamEvent::BufferUnderflow { stream: handle });
            return (0, Emitted::Underflow);
        };

        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        if frame.fill(payload, sequence).is_err() {
            pool.reclaim(frame);
            observer.on_event(StreamEvent::BufferOverflow { stream: handle });
            return (sequence, Emitted::Overflow);
        }
        self.emitted.fetch_add(1, Ordering::Relaxed);

        match observer.on_frame(frame) {
            FrameDisposition::HandedOff => (sequence, Emitted::HandedOff),
            FrameDisposition::Consumed(frame) => {
                self.record_return(frame.sequence(), true);
                pool.reclaim(frame);
                (sequence, Emitted::Reclaimed)
            }
        }
    }

    fn record_return(&self, sequence: u64, at_push: bool) {
        let mut state = self.lock();
        *state.returned.entry(sequence).or_insert(0) += 1;
        if at_push {
            state.counters.reclaims += 1;
        } else {
            state.counters.returns += 1;
        }
    }

    fn start_generator(self: &Arc<Self>, fps: u32) {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let shared = Arc::clone(self);
        let period = Duration::from_secs(1) / fps;

        let thread = thread::spawn(move || {
            let mut payload = vec![0u8; 4096];
            payload[8..].iter_mut().enumerate().for_each(|(i, b)| *b = i as u8);
            while flag.load(Ordering::Relaxed) {
                let tag = shared.next_sequence.load(Ordering::Relaxed);
                payload[..8].copy_from_slice(&tag.to_le_bytes());
                shared.emit_frame(&payload);
                thread::sleep(period);
            }
        });

        if let Ok(mut generator) = self.generator.lock() {
            *generator = Some(Generator { running, thread });
        }
    }

    fn stop_generator(&self) {
        let generator = self.generator.lock().ok().and_then(|mut g| g.take());
        if let Some(generator) = generator {
            generator.running.store(false, Ordering::Relaxed);
            // The generator itself may be the one reporting a disconnect
            if generator.thread.thread().id() != thread::current().id() {
                let _ = generator.thread.join();
            }
        }
    }
}

impl UvcDriver for MockDriver {
    fn open(
        &self,
        config: &StreamConfig,
        observer: Arc<dyn StreamObserver>,
        timeout: Duration,
    ) -> Result<StreamHandle> {
        let mut state = self.shared.lock();
        if state.failures_left > 0 {
            state.failures_left -= 1;
            state.counters.failed_opens += 1;
            debug!(remaining = state.failures_left, "Mock open failing as scripted");
            return Err(UvcError::OpenTimeout(timeout));
        }
        if state.active.is_some() {
            return Err(UvcError::Device("a stream is already open".into()));
        }

        let frame_size = match config.buffers.frame_size {
            0 => DEFAULT_FRAME_SIZE,
            size => size,
        };
        let handle = StreamHandle::new(self.shared.next_stream.fetch_add(1, Ordering::Relaxed));
        state.active = Some(ActiveStream {
            handle,
            observer,
            pool: Arc::new(FrameBufferPool::new(config.buffers.frame_buffers, frame_size)),
            started: false,
        });
        state.counters.opens += 1;
        info!(%handle, frame_size, "Mock device opened");
        Ok(handle)
    }

    fn start(&self, stream: StreamHandle) -> Result<()> {
        {
            let mut state = self.shared.lock();
            match state.active.as_mut() {
                Some(active) if active.handle == stream => active.started = true,
                _ => return Err(UvcError::UnknownStream(stream)),
            }
            state.counters.starts += 1;
        }
        if let Some(fps) = self.shared.generator_fps {
            self.shared.start_generator(fps);
        }
        Ok(())
    }

    fn stop(&self, stream: StreamHandle) -> Result<()> {
        self.shared.stop_generator();
        let mut state = self.shared.lock();
        match state.active.as_mut() {
            Some(active) if active.handle == stream => active.started = false,
            _ => return Err(UvcError::UnknownStream(stream)),
        }
        state.counters.stops += 1;
        Ok(())
    }

    fn close(&self, stream: StreamHandle) -> Result<()> {
        self.shared.stop_generator();
        let mut state = self.shared.lock();
        match state.active.take() {
            Some(active) if active.handle == stream => {
                state.retired.insert(stream, active.pool);
                state.counters.closes += 1;
                info!(%stream, "Mock device closed");
                Ok(())
            }
            other => {
                state.active = other;
                Err(UvcError::UnknownStream(stream))
            }
        }
    }

    fn return_buffer(&self, stream: StreamHandle, frame: FrameBuffer) {
        self.shared.record_return(frame.sequence(), false);
        let state = self.shared.lock();
        let pool = match &state.active {
            Some(active) if active.handle == stream => Some(Arc::clone(&active.pool)),
            _ => state.retired.get(&stream).cloned(),
        };
        drop(state);
        match pool {
            Some(pool) => pool.reclaim(frame),
            None => debug!(%stream, "Buffer returned to unknown stream, discarding"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hands every frame straight back
    #[derive(Default)]
    struct Declining {
        events: AtomicUsize,
    }

    impl StreamObserver for Declining {
        fn on_frame(&self, frame: FrameBuffer) -> FrameDisposition {
            FrameDisposition::Consumed(frame)
        }

        fn on_event(&self, _event: StreamEvent) {
            self.events.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Keeps every frame it is given
    #[derive(Default)]
    struct Hoarding {
        frames: Mutex<Vec<FrameBuffer>>,
        events: Mutex<Vec<StreamEvent>>,
    }

    impl StreamObserver for Hoarding {
        fn on_frame(&self, frame: FrameBuffer) -> FrameDisposition {
            self.frames.lock().unwrap().push(frame);
            FrameDisposition::HandedOff
        }

        fn on_event(&self, event: StreamEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn small_config() -> StreamConfig {
        let mut config = StreamConfig::default();
        config.buffers.frame_buffers = 2;
        config.buffers.frame_size = 8;
        config
    }

    #[test]
    fn scripted_failures_precede_success() {
        let driver = MockDriver::failing_opens(2);
        let observer = Arc::new(Declining::default());
        let timeout = Duration::from_millis(1);

        for _ in 0..2 {
            let err = driver.open(&small_config(), observer.clone(), timeout).unwrap_err();
            assert!(matches!(err, UvcError::OpenTimeout(_)));
        }
        let stream = driver.open(&small_config(), observer, timeout).unwrap();
        assert_eq!(driver.active_stream(), Some(stream));
        assert_eq!(driver.counters().failed_opens, 2);
        assert_eq!(driver.counters().opens, 1);
    }

    #[test]
    fn frames_need_a_started_stream() {
        let driver = MockDriver::new();
        let observer = Arc::new(Declining::default());
        let stream = driver
            .open(&small_config(), observer, Duration::ZERO)
            .unwrap();

        assert_eq!(driver.emit_frame(b"abc").1, Emitted::NotStreaming);
        driver.start(stream).unwrap();
        let (sequence, outcome) = driver.emit_frame(b"abc");
        assert_eq!(outcome, Emitted::Reclaimed);
        assert_eq!(driver.return_count(sequence), 1);
        assert!(driver.all_returned_once());
    }

    #[test]
    fn exhausted_pool_and_oversized_frames_raise_events() {
        let driver = MockDriver::new();
        let observer = Arc::new(Hoarding::default());
        let stream = driver
            .open(&small_config(), observer.clone(), Duration::ZERO)
            .unwrap();
        driver.start(stream).unwrap();

        assert_eq!(driver.emit_frame(&[0u8; 9]).1, Emitted::Overflow);
        assert_eq!(driver.emit_frame(b"one").1, Emitted::HandedOff);
        assert_eq!(driver.emit_frame(b"two").1, Emitted::HandedOff);
        assert_eq!(driver.emit_frame(b"three").1, Emitted::Underflow);

        let events = observer.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                StreamEvent::BufferOverflow { stream },
                StreamEvent::BufferUnderflow { stream },
            ]
        );

        for frame in observer.frames.lock().unwrap().drain(..) {
            driver.return_buffer(stream, frame);
        }
        assert!(driver.all_returned_once());
        assert_eq!(driver.emit_frame(b"four").1, Emitted::HandedOff);
    }

    #[test]
    fn disconnect_stops_the_stream_before_notifying() {
        let driver = MockDriver::new();
        let observer = Arc::new(Declining::default());
        let stream = driver
            .open(&small_config(), observer.clone(), Duration::ZERO)
            .unwrap();
        driver.start(stream).unwrap();

        assert!(driver.emit_event(|stream| StreamEvent::DeviceDisconnected { stream }));
        assert!(!driver.is_started());
        assert_eq!(observer.events.load(Ordering::Relaxed), 1);

        driver.close(stream).unwrap();
        assert!(!driver.emit_event(|stream| StreamEvent::BufferOverflow { stream }));
        assert!(matches!(
            driver.close(stream),
            Err(UvcError::UnknownStream(_))
        ));
    }
}
