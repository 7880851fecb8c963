//! uvcstream: capture frames from a UVC camera and hand them to a consumer

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use color_eyre::{eyre::eyre, Result};
use tracing::{info, trace};
use tracing_subscriber::EnvFilter;

use uvcstream::capture::{MockDriver, V4l2Driver};
use uvcstream::{CallbackRegistry, Config, DeviceSession, FrameSink, SourceKind, UvcDriver};

/// Logs frame sizes and reports throughput once per interval
struct ThroughputLog {
    interval: Duration,
    frames: AtomicU64,
    bytes: AtomicU64,
    window: Mutex<Instant>,
}

impl ThroughputLog {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            frames: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            window: Mutex::new(Instant::now()),
        }
    }
}

impl FrameSink for ThroughputLog {
    fn on_frame(&self, data: &[u8]) {
        trace!("Frame of {} bytes", data.len());
        self.frames.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(data.len() as u64, Ordering::Relaxed);

        let Ok(mut window) = self.window.lock() else {
            return;
        };
        let elapsed = window.elapsed();
        if elapsed < self.interval {
            return;
        }
        *window = Instant::now();

        let frames = self.frames.swap(0, Ordering::Relaxed);
        let bytes = self.bytes.swap(0, Ordering::Relaxed);
        let secs = elapsed.as_secs_f64();
        info!(
            "{:.1} fps, {:.1} KiB/s",
            frames as f64 / secs,
            bytes as f64 / 1024.0 / secs
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("uvcstream=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("uvcstream launching...");

    let path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = Config::load(path.as_deref())?;
    info!("Configuration: {:?}", config);

    let driver: Arc<dyn UvcDriver> = match config.source {
        SourceKind::V4l2 => Arc::new(V4l2Driver::new()),
        SourceKind::Synthetic => Arc::new(MockDriver::synthetic(config.stream.fps)),
    };

    let registry = Arc::new(CallbackRegistry::new());
    registry.register(ThroughputLog::new(Duration::from_secs(1)));

    let session = DeviceSession::new(&config, driver, registry).spawn()?;
    info!("Session running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    let stats = session.stats();
    tokio::task::spawn_blocking(move || session.shutdown())
        .await
        .map_err(|e| eyre!("Shutdown task failed: {}", e))??;

    info!("Final stats: {:?}", stats);
    Ok(())
}
