//! Bounded hand-off queue between the driver's transfer context and the session

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam::utils::CachePadded;
use flume::{Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::capture::FrameBuffer;

/// Bounded FIFO of borrowed frame buffers.
///
/// Pushing transfers ownership of a buffer to the queue, popping transfers it
/// to the consumer. `try_push` never waits; when the queue is full the frame
/// is handed straight back so the caller can return it to the driver pool.
pub struct FrameHandoffQueue {
    tx: Sender<FrameBuffer>,
    rx: Receiver<FrameBuffer>,
    capacity: usize,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    frames_pushed: AtomicUsize,
    frames_popped: AtomicUsize,
    frames_dropped: AtomicUsize,
}

/// Snapshot of the queue counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pushed: usize,
    pub popped: usize,
    pub dropped: usize,
}

impl FrameHandoffQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = flume::bounded(capacity);
        Self {
            tx,
            rx,
            capacity,
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Producer: enqueue without blocking.
    ///
    /// On a full queue the frame comes back in `Err` and is not retained.
    pub fn try_push(&self, frame: FrameBuffer) -> Result<(), FrameBuffer> {
        match self.tx.try_send(frame) {
            Ok(()) => {
                self.stats.frames_pushed.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            // The queue owns both ends, so it can never be disconnected
            Err(TrySendError::Full(frame)) | Err(TrySendError::Disconnected(frame)) => {
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                Err(frame)
            }
        }
    }

    /// Consumer: wait up to `timeout` for the oldest frame.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<FrameBuffer> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => {
                self.stats.frames_popped.fetch_add(1, Ordering::Relaxed);
                Some(frame)
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Consumer: take the oldest frame if one is waiting.
    pub fn try_pop(&self) -> Option<FrameBuffer> {
        let frame = self.rx.try_recv().ok()?;
        self.stats.frames_popped.fetch_add(1, Ordering::Relaxed);
        Some(frame)
    }

    /// Consumer: take everything currently queued, oldest first.
    pub fn drain(&self) -> Vec<FrameBuffer> {
        std::iter::from_fn(|| self.try_pop()).collect()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.rx.is_full()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pushed: self.stats.frames_pushed.load(Ordering::Relaxed),
            popped: self.stats.frames_popped.load(Ordering::Relaxed),
            dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FrameBufferPool, StreamHandle};
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    const STREAM: StreamHandle = StreamHandle::new(1);

    fn tagged(pool: &FrameBufferPool, tag: u64) -> FrameBuffer {
        let mut frame = pool.lend(STREAM).expect("pool exhausted");
        frame.fill(&tag.to_le_bytes(), tag).unwrap();
        frame
    }

    #[test]
    fn push_on_full_queue_hands_frame_back() {
        let pool = FrameBufferPool::new(8, 8);
        let queue = FrameHandoffQueue::new(3);

        for tag in 1..=3 {
            assert!(queue.try_push(tagged(&pool, tag)).is_ok());
        }
        assert!(queue.is_full());

        let started = Instant::now();
        let rejected = queue.try_push(tagged(&pool, 4)).unwrap_err();
        assert!(started.elapsed() < Duration::from_millis(50));
        assert_eq!(rejected.sequence(), 4);
        assert_eq!(queue.len(), 3);
        pool.reclaim(rejected);

        let order: Vec<u64> = queue.drain().iter().map(FrameBuffer::sequence).collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert_eq!(
            queue.stats(),
            QueueStats {
                pushed: 3,
                popped: 3,
                dropped: 1
            }
        );
    }

    #[test]
    fn pop_times_out_on_empty_queue() {
        let queue = FrameHandoffQueue::new(3);
        let started = Instant::now();
        assert!(queue.pop_timeout(Duration::from_millis(20)).is_none());
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn preserves_order_across_threads() {
        let pool = Arc::new(FrameBufferPool::new(64, 8));
        let queue = Arc::new(FrameHandoffQueue::new(3));

        let producer = {
            let pool = Arc::clone(&pool);
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let mut accepted = Vec::new();
                for tag in 1..=200u64 {
                    let Some(mut frame) = pool.lend(STREAM) else {
                        thread::yield_now();
                        continue;
                    };
                    frame.fill(&tag.to_le_bytes(), tag).unwrap();
                    match queue.try_push(frame) {
                        Ok(()) => accepted.push(tag),
                        Err(frame) => pool.reclaim(frame),
                    }
                }
                accepted
            })
        };

        let mut seen = Vec::new();
        loop {
            match queue.pop_timeout(Duration::from_millis(100)) {
                Some(frame) => {
                    assert!(queue.len() <= queue.capacity());
                    seen.push(frame.sequence());
                    pool.reclaim(frame);
                }
                None if producer.is_finished() && queue.is_empty() => break,
                None => {}
            }
        }

        let accepted = producer.join().unwrap();
        assert_eq!(seen, accepted);
        assert_eq!(pool.lent(), 0);
    }
}
