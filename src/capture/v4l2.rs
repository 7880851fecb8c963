//! V4L2 driver: USB video class cameras through the kernel's uvcvideo

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::driver::{StreamObserver, UvcDriver};
use super::frame::{FrameBuffer, FrameDisposition, StreamEvent, StreamHandle};
use super::pool::FrameBufferPool;
use crate::error::{Result, UvcError};
use crate::utils;
use crate::StreamConfig;

/// How often `open` looks for a device while waiting
const PROBE_INTERVAL: Duration = Duration::from_millis(250);
/// Longest a transfer thread waits for a frame before rechecking its stop flag
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(500);
/// Pause after a failed transfer so a wedged device cannot spin the thread
const ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Kernel-backed UVC driver
pub struct V4l2Driver {
    next_stream: AtomicU64,
    active: Mutex<Option<OpenStream>>,
}

struct OpenStream {
    handle: StreamHandle,
    path: String,
    device: Arc<Device>,
    pool: Arc<FrameBufferPool>,
    observer: Arc<dyn StreamObserver>,
    transfers: u32,
    transfer: Option<Transfer>,
}

struct Transfer {
    running: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl Transfer {
    fn halt(self) {
        self.running.store(false, Ordering::SeqCst);
        // A transfer thread reporting its own disconnect closes the stream
        // from inside; it exits by itself right after
        if self.thread.thread().id() != thread::current().id() {
            let _ = self.thread.join();
        }
    }
}

/// Everything a transfer thread needs, detached from the driver lock
struct TransferContext {
    handle: StreamHandle,
    path: String,
    device: Arc<Device>,
    pool: Arc<FrameBufferPool>,
    observer: Arc<dyn StreamObserver>,
    transfers: u32,
    running: Arc<AtomicBool>,
}

impl Default for V4l2Driver {
    fn default() -> Self {
        Self::new()
    }
}

impl V4l2Driver {
    pub fn new() -> Self {
        Self {
            next_stream: AtomicU64::new(1),
            active: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<OpenStream>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Device node to try right now, if any is present
    fn locate(config: &StreamConfig) -> Option<String> {
        match &config.device {
            Some(path) if Path::new(path).exists() => Some(path.clone()),
            Some(_) => None,
            None => utils::find_capture_device(config.format).map(|found| found.path),
        }
    }

    /// Opens `path` and negotiates the configured format
    fn configure(path: &str, config: &StreamConfig) -> Result<(Device, usize)> {
        let device = Device::with_path(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => UvcError::DeviceNotFound(path.to_string()),
            _ => UvcError::Io(e),
        })?;

        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(UvcError::Device(format!("{} does not support video capture", path)));
        }

        let wanted = FourCC::new(&config.format.fourcc());
        let mut fmt = device.format()?;
        fmt.width = config.width;
        fmt.height = config.height;
        fmt.fourcc = wanted;
        let fmt = device.set_format(&fmt)?;
        if fmt.fourcc != wanted {
            return Err(UvcError::Device(format!(
                "{} does not deliver {:?}",
                path, config.format
            )));
        }
        if fmt.width != config.width || fmt.height != config.height {
            warn!(
                "Device adjusted resolution to {}x{} (requested {}x{})",
                fmt.width, fmt.height, config.width, config.height
            );
        }

        if let Err(e) = device.set_params(&Parameters::with_fps(config.fps)) {
            warn!("Could not set frame rate to {} fps: {}", config.fps, e);
        }

        // 0 means trust the size negotiated with the device, which may be generous
        let frame_size = match config.buffers.frame_size {
            0 => fmt.size as usize,
            size => size,
        };
        debug!(
            placement = ?config.buffers.placement,
            transfer_size = config.buffers.transfer_size,
            "Buffer placement and transfer size are left to the kernel"
        );

        Ok((device, frame_size))
    }
}

impl UvcDriver for V4l2Driver {
    #[instrument(skip(self, config, observer))]
    fn open(
        &self,
        config: &StreamConfig,
        observer: Arc<dyn StreamObserver>,
        timeout: Duration,
    ) -> Result<StreamHandle> {
        if self.lock().is_some() {
            return Err(UvcError::Device("a stream is already open".into()));
        }

        let deadline = Instant::now() + timeout;
        let path = loop {
            if let Some(path) = Self::locate(config) {
                break path;
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(UvcError::OpenTimeout(timeout));
            }
            thread::sleep(PROBE_INTERVAL.min(deadline - now));
        };

        let (device, frame_size) = Self::configure(&path, config)?;
        let handle = StreamHandle::new(self.next_stream.fetch_add(1, Ordering::Relaxed));
        let pool = Arc::new(FrameBufferPool::new(config.buffers.frame_buffers, frame_size));

        info!(
            %handle,
            path = %path,
            buffers = pool.capacity(),
            frame_size,
            "V4L2 stream opened"
        );

        *self.lock() = Some(OpenStream {
            handle,
            path,
            device: Arc::new(device),
            pool,
            observer,
            transfers: config.buffers.transfers,
            transfer: None,
        });
        Ok(handle)
    }

    fn start(&self, stream: StreamHandle) -> Result<()> {
        let mut active = self.lock();
        let open = match active.as_mut() {
            Some(open) if open.handle == stream => open,
            _ => return Err(UvcError::UnknownStream(stream)),
        };
        if open.transfer.is_some() {
            return Ok(());
        }

        let running = Arc::new(AtomicBool::new(true));
        let context = TransferContext {
            handle: open.handle,
            path: open.path.clone(),
            device: Arc::clone(&open.device),
            pool: Arc::clone(&open.pool),
            observer: Arc::clone(&open.observer),
            transfers: open.transfers,
            running: Arc::clone(&running),
        };
        let thread = thread::Builder::new()
            .name("uvc_xfer".into())
            .spawn(move || context.run())?;

        open.transfer = Some(Transfer { running, thread });
        info!(%stream, "Capture stream started");
        Ok(())
    }

    fn stop(&self, stream: StreamHandle) -> Result<()> {
        let transfer = {
            let mut active = self.lock();
            match active.as_mut() {
                Some(open) if open.handle == stream => open.transfer.take(),
                _ => return Err(UvcError::UnknownStream(stream)),
            }
        };
        if let Some(transfer) = transfer {
            transfer.halt();
            info!(%stream, "Capture stream stopped");
        }
        Ok(())
    }

    fn close(&self, stream: StreamHandle) -> Result<()> {
        let open = {
            let mut active = self.lock();
            match active.take() {
                Some(open) if open.handle == stream => open,
                other => {
                    *active = other;
                    return Err(UvcError::UnknownStream(stream));
                }
            }
        };
        if let Some(transfer) = open.transfer {
            transfer.halt();
        }
        info!(%stream, path = %open.path, "V4L2 stream closed");
        Ok(())
    }

    fn return_buffer(&self, stream: StreamHandle, frame: FrameBuffer) {
        let pool = match self.lock().as_ref() {
            Some(open) if open.handle == stream => Some(Arc::clone(&open.pool)),
            _ => None,
        };
        match pool {
            Some(pool) => pool.reclaim(frame),
            // The stream and its pool are gone; the memory goes with the frame
            None => debug!(%stream, sequence = frame.sequence(), "Dropping buffer of closed stream"),
        }
    }
}

impl TransferContext {
    fn run(self) {
        let mut stream =
            match MmapStream::with_buffers(&self.device, Type::VideoCapture, self.transfers) {
                Ok(stream) => stream,
                Err(e) => {
                    error!(stream = %self.handle, "Failed to map capture buffers: {}", e);
                    self.fail(&e);
                    return;
                }
            };
        stream.set_timeout(DEQUEUE_TIMEOUT);

        let mut sequence = 0u64;
        while self.running.load(Ordering::SeqCst) {
            let result = match stream.next() {
                Ok((buf, meta)) => {
                    let used = (meta.bytesused as usize).min(buf.len());
                    sequence += 1;
                    self.deliver(&buf[..used], sequence);
                    Ok(())
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(()),
                Err(e) => Err(e),
            };

            if let Err(e) = result {
                if self.fail(&e) {
                    return;
                }
                thread::sleep(ERROR_BACKOFF);
            }
        }
        debug!(stream = %self.handle, "Transfer thread exiting");
    }

    /// Copies one dequeued image into a pool buffer and offers it upstream
    fn deliver(&self, payload: &[u8], sequence: u64) {
        let stream = self.handle;
        if payload.len() > self.pool.buffer_size() {
            self.observer.on_event(StreamEvent::BufferOverflow { stream });
            return;
        }
        let Some(mut frame) = self.pool.lend(stream) else {
            self.observer.on_event(StreamEvent::BufferUnderflow { stream });
            return;
        };
        if frame.fill(payload, sequence).is_err() {
            self.pool.reclaim(frame);
            self.observer.on_event(StreamEvent::BufferOverflow { stream });
            return;
        }

        match self.observer.on_frame(frame) {
            FrameDisposition::HandedOff => {}
            FrameDisposition::Consumed(frame) => self.pool.reclaim(frame),
        }
    }

    /// Reports a failed transfer. Returns `true` when the device is gone.
    fn fail(&self, e: &io::Error) -> bool {
        let stream = self.handle;
        let gone = e.raw_os_error() == Some(libc::ENODEV) || !Path::new(&self.path).exists();
        if gone {
            self.running.store(false, Ordering::SeqCst);
            self.observer.on_event(StreamEvent::DeviceDisconnected { stream });
            return true;
        }

        let code = e.raw_os_error().unwrap_or(-1);
        self.observer.on_event(StreamEvent::TransferError { stream, code });
        false
    }
}
