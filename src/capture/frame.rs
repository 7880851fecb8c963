use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Opaque identifier of one open driver stream.
///
/// A fresh handle is issued on every successful open, so events and buffers
/// belonging to a stream that has since been closed can be told apart from
/// the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle(u64);

impl StreamHandle {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

/// A frame buffer lent by the driver's pool.
///
/// The handle owns the buffer memory while it is on loan and is deliberately
/// neither `Clone` nor `Copy`: whoever holds it is the single live holder and
/// must give it back through `UvcDriver::return_buffer` (or the pool) exactly
/// once. Dropping it instead frees the allocation and shrinks the pool.
pub struct FrameBuffer {
    data: Box<[u8]>,
    len: usize,
    stream: StreamHandle,
    sequence: u64,
    timestamp: Instant,
}

impl FrameBuffer {
    /// Wraps an empty pool allocation lent to `stream`.
    pub(crate) fn from_storage(data: Box<[u8]>, stream: StreamHandle) -> Self {
        Self {
            data,
            len: 0,
            stream,
            sequence: 0,
            timestamp: Instant::now(),
        }
    }

    pub(crate) fn into_storage(self) -> Box<[u8]> {
        self.data
    }

    /// Copies a captured image into the buffer and stamps it.
    ///
    /// Fails (leaving the buffer untouched) when the image does not fit.
    pub fn fill(&mut self, payload: &[u8], sequence: u64) -> Result<(), usize> {
        if payload.len() > self.data.len() {
            return Err(payload.len());
        }
        self.data[..payload.len()].copy_from_slice(payload);
        self.len = payload.len();
        self.sequence = sequence;
        self.timestamp = Instant::now();
        Ok(())
    }

    /// Read-only view of the captured bytes.
    pub fn data(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The stream whose pool lent this buffer, and which must get it back.
    pub fn stream(&self) -> StreamHandle {
        self.stream
    }

    /// Size of the underlying allocation.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Driver-assigned capture sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// When the capture completed.
    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }
}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("stream", &self.stream)
            .field("sequence", &self.sequence)
            .field("len", &self.len)
            .field("capacity", &self.data.len())
            .finish()
    }
}

/// What the producer did with a frame the driver offered it.
#[derive(Debug)]
pub enum FrameDisposition {
    /// The frame was not kept; the driver reclaims the buffer immediately.
    Consumed(FrameBuffer),
    /// Ownership moved out of the driver; the buffer comes back later
    /// through `return_buffer`.
    HandedOff,
}

/// Out-of-band notification from the driver.
///
/// Delivered once per occurrence and consumed synchronously; never queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    /// A USB transfer failed. Streaming continues.
    TransferError { stream: StreamHandle, code: i32 },
    /// The device went away. The driver has already torn down its side.
    DeviceDisconnected { stream: StreamHandle },
    /// A captured frame exceeded the single-buffer capacity and was discarded.
    BufferOverflow { stream: StreamHandle },
    /// No free pool buffer was available to capture into.
    BufferUnderflow { stream: StreamHandle },
}

impl StreamEvent {
    pub fn stream(&self) -> StreamHandle {
        match *self {
            StreamEvent::TransferError { stream, .. }
            | StreamEvent::DeviceDisconnected { stream }
            | StreamEvent::BufferOverflow { stream }
            | StreamEvent::BufferUnderflow { stream } => stream,
        }
    }
}

/// Compressed formats a UVC camera may deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Mjpeg,
    H264,
    H265,
    Yuyv,
}

impl PixelFormat {
    pub fn fourcc(&self) -> [u8; 4] {
        match self {
            PixelFormat::Mjpeg => *b"MJPG",
            PixelFormat::H264 => *b"H264",
            PixelFormat::H265 => *b"HEVC",
            PixelFormat::Yuyv => *b"YUYV",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_rejects_oversized_payload() {
        let stream = StreamHandle::new(1);
        let mut frame = FrameBuffer::from_storage(vec![0u8; 4].into_boxed_slice(), stream);
        assert_eq!(frame.fill(&[1, 2, 3, 4, 5], 1), Err(5));
        assert!(frame.is_empty());

        frame.fill(&[9, 8, 7], 42).unwrap();
        assert_eq!(frame.data(), &[9, 8, 7]);
        assert_eq!(frame.sequence(), 42);
        assert_eq!(frame.capacity(), 4);
        assert_eq!(frame.stream(), stream);
    }

    #[test]
    fn event_reports_its_stream() {
        let stream = StreamHandle::new(7);
        let event = StreamEvent::TransferError { stream, code: -5 };
        assert_eq!(event.stream(), stream);
        assert_eq!(stream.to_string(), "stream#7");
    }
}
