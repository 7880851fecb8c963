//! Driver-facing half of the pipeline: frame arrival and stream events

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::queue::FrameHandoffQueue;
use super::session::{Connection, SessionCounters};
use crate::capture::{FrameBuffer, FrameDisposition, StreamEvent, StreamObserver, UvcDriver};

/// Observer installed on every stream the session opens.
///
/// Runs entirely on driver threads. Frame arrival only ever touches the
/// lock-free queue and counters, never a lock or a wait.
pub struct StreamEventSink {
    queue: Arc<FrameHandoffQueue>,
    connection: Arc<Connection>,
    counters: Arc<SessionCounters>,
    driver: Arc<dyn UvcDriver>,
}

impl StreamEventSink {
    pub(crate) fn new(
        queue: Arc<FrameHandoffQueue>,
        connection: Arc<Connection>,
        counters: Arc<SessionCounters>,
        driver: Arc<dyn UvcDriver>,
    ) -> Self {
        Self {
            queue,
            connection,
            counters,
            driver,
        }
    }
}

impl StreamObserver for StreamEventSink {
    fn on_frame(&self, frame: FrameBuffer) -> FrameDisposition {
        debug!(sequence = frame.sequence(), len = frame.len(), "Frame callback");

        if !self.connection.is_streaming() {
            // Late frame from a stream the session already left
            return FrameDisposition::Consumed(frame);
        }

        match self.queue.try_push(frame) {
            Ok(()) => FrameDisposition::HandedOff,
            Err(frame) => {
                warn!(sequence = frame.sequence(), "Queue full, losing frame");
                self.counters.record_drop();
                FrameDisposition::Consumed(frame)
            }
        }
    }

    fn on_event(&self, event: StreamEvent) {
        match event {
            StreamEvent::TransferError { stream, code } => {
                error!(%stream, code, "USB error has occurred");
                self.counters.record_transfer_error();
            }
            StreamEvent::DeviceDisconnected { stream } => {
                self.counters.record_disconnect();
                if self.connection.end(stream) {
                    info!(%stream, "Device suddenly disconnected");
                } else {
                    debug!(%stream, "Disconnect for a stream that is no longer active");
                }
                if let Err(e) = self.driver.close(stream) {
                    error!(%stream, "Failed to close disconnected stream: {}", e);
                }
            }
            StreamEvent::BufferOverflow { stream } => {
                // Raise stream.buffers.frame_size if this keeps happening
                warn!(%stream, "Frame buffer overflow");
                self.counters.record_overflow();
            }
            StreamEvent::BufferUnderflow { stream } => {
                // Consumer is falling behind, or stream.buffers.frame_buffers is too small
                warn!(%stream, "Frame buffer underflow");
                self.counters.record_underflow();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{MockDriver, StreamHandle};
    use crate::pipeline::ConnectionState;
    use crate::StreamConfig;
    use std::time::Duration;
    use tracing_test::traced_test;

    struct Fixture {
        driver: MockDriver,
        queue: Arc<FrameHandoffQueue>,
        connection: Arc<Connection>,
        counters: Arc<SessionCounters>,
        stream: StreamHandle,
    }

    fn streaming(capacity: usize) -> Fixture {
        let driver = MockDriver::new();
        let queue = Arc::new(FrameHandoffQueue::new(capacity));
        let connection = Arc::new(Connection::default());
        let counters = Arc::new(SessionCounters::default());
        let sink = Arc::new(StreamEventSink::new(
            Arc::clone(&queue),
            Arc::clone(&connection),
            Arc::clone(&counters),
            Arc::new(driver.clone()),
        ));

        let stream = driver
            .open(&StreamConfig::default(), sink, Duration::ZERO)
            .unwrap();
        connection.begin(stream);
        driver.start(stream).unwrap();

        Fixture {
            driver,
            queue,
            connection,
            counters,
            stream,
        }
    }

    #[test]
    fn fourth_frame_is_reclaimed_when_queue_holds_three() {
        let fx = streaming(3);
        let outcomes: Vec<_> = (1..=4u64)
            .map(|tag| fx.driver.emit_frame(&tag.to_le_bytes()))
            .collect();

        assert_eq!(fx.queue.len(), 3);
        let (dropped_seq, dropped) = outcomes[3];
        assert_eq!(dropped, crate::capture::mock::Emitted::Reclaimed);
        assert_eq!(fx.driver.return_count(dropped_seq), 1);
        assert_eq!(fx.counters.snapshot().frames_dropped, 1);

        let queued: Vec<u64> = fx.queue.drain().iter().map(FrameBuffer::sequence).collect();
        let expected: Vec<u64> = outcomes[..3].iter().map(|(seq, _)| *seq).collect();
        assert_eq!(queued, expected);
    }

    #[test]
    #[traced_test]
    fn disconnect_ends_streaming_and_closes_stream() {
        let fx = streaming(3);
        assert_eq!(fx.connection.state(), ConnectionState::Streaming);

        fx.driver
            .emit_event(|stream| StreamEvent::DeviceDisconnected { stream });

        assert_eq!(fx.connection.state(), ConnectionState::Disconnected);
        assert_eq!(fx.driver.counters().closes, 1);
        assert!(fx.driver.active_stream().is_none());
        assert!(logs_contain("Device suddenly disconnected"));
    }

    #[test]
    fn stale_disconnect_leaves_current_stream_alone() {
        let fx = streaming(3);
        let stale = StreamHandle::new(fx.stream.id() + 100);

        let sink = StreamEventSink::new(
            Arc::clone(&fx.queue),
            Arc::clone(&fx.connection),
            Arc::clone(&fx.counters),
            Arc::new(fx.driver.clone()),
        );
        sink.on_event(StreamEvent::DeviceDisconnected { stream: stale });

        assert_eq!(fx.connection.state(), ConnectionState::Streaming);
        assert_eq!(fx.driver.active_stream(), Some(fx.stream));
    }

    #[test]
    #[traced_test]
    fn warnings_do_not_change_state() {
        let fx = streaming(3);
        fx.driver
            .emit_event(|stream| StreamEvent::TransferError { stream, code: -71 });
        fx.driver
            .emit_event(|stream| StreamEvent::BufferOverflow { stream });
        fx.driver
            .emit_event(|stream| StreamEvent::BufferUnderflow { stream });

        assert_eq!(fx.connection.state(), ConnectionState::Streaming);
        let stats = fx.counters.snapshot();
        assert_eq!(stats.transfer_errors, 1);
        assert_eq!(stats.buffer_overflows, 1);
        assert_eq!(stats.buffer_underflows, 1);
        assert!(logs_contain("USB error has occurred"));
        assert!(logs_contain("Frame buffer overflow"));
        assert!(logs_contain("Frame buffer underflow"));
    }

    #[test]
    fn frames_after_disconnect_are_not_queued() {
        let fx = streaming(3);
        fx.connection.end(fx.stream);

        let (sequence, outcome) = fx.driver.emit_frame(b"late");
        assert_eq!(outcome, crate::capture::mock::Emitted::Reclaimed);
        assert_eq!(fx.driver.return_count(sequence), 1);
        assert!(fx.queue.is_empty());
    }
}
