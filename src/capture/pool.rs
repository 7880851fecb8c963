//! Fixed-size pool of frame buffers owned by a driver stream

use crossbeam::queue::ArrayQueue;
use crossbeam::utils::CachePadded;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::frame::{FrameBuffer, StreamHandle};

/// Pre-allocated frame buffers lent out one capture at a time.
///
/// Both `lend` and `reclaim` are lock-free so the transfer context can use
/// them without ever waiting.
pub struct FrameBufferPool {
    free: ArrayQueue<Box<[u8]>>,
    buffer_size: usize,
    lent: CachePadded<AtomicUsize>,
}

impl FrameBufferPool {
    pub fn new(count: usize, buffer_size: usize) -> Self {
        let count = count.max(1);
        let free = ArrayQueue::new(count);
        for _ in 0..count {
            // Cannot fail: the queue was sized for exactly `count` buffers
            let _ = free.push(vec![0u8; buffer_size].into_boxed_slice());
        }

        Self {
            free,
            buffer_size,
            lent: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Takes a free buffer for `stream`, or `None` when every buffer is on loan.
    pub fn lend(&self, stream: StreamHandle) -> Option<FrameBuffer> {
        let storage = self.free.pop()?;
        self.lent.fetch_add(1, Ordering::Relaxed);
        Some(FrameBuffer::from_storage(storage, stream))
    }

    /// Puts a buffer back on the free list.
    pub fn reclaim(&self, frame: FrameBuffer) {
        let storage = frame.into_storage();
        if storage.len() != self.buffer_size || self.free.push(storage).is_err() {
            // Not one of ours; let it drop rather than grow the pool
            tracing::warn!("Discarding foreign buffer returned to pool");
            return;
        }
        self.lent.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn lent(&self) -> usize {
        self.lent.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.free.capacity()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}
