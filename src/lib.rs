pub mod capture;
pub mod error;
pub mod pipeline;
pub mod utils;

use std::path::Path;
use std::time::Duration;

use capture::frame::PixelFormat;
use serde::{Deserialize, Serialize};

pub use capture::{FrameBuffer, StreamEvent, StreamHandle, UvcDriver};
pub use error::{Result, UvcError};
pub use pipeline::{
    CallbackRegistry, ConnectionState, DeviceSession, FrameHandoffQueue, FrameSink, SessionHandle,
    SessionStats,
};

/// Prefix of environment variables overriding file configuration,
/// e.g. `UVCSTREAM__SESSION__QUEUE_CAPACITY=4`.
pub const ENV_PREFIX: &str = "UVCSTREAM";

/// System configuration, fixed once the session starts
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub source: SourceKind,
    pub stream: StreamConfig,
    pub session: SessionConfig,
}

/// Which driver feeds the session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[default]
    V4l2,
    /// In-process generator, no hardware needed
    Synthetic,
}

/// Stream descriptor handed to the driver on every open
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Device node; auto-detected when unset
    pub device: Option<String>,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
    pub buffers: BufferPoolConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferPoolConfig {
    /// Frame buffers in the driver pool
    pub frame_buffers: usize,
    /// Bytes per frame buffer; 0 uses the size negotiated with the device
    pub frame_size: usize,
    /// In-flight transfers kept queued with the device
    pub transfers: u32,
    /// Bytes per transfer
    pub transfer_size: usize,
    pub placement: MemoryPlacement,
}

/// Where frame buffers should live, for drivers that care
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryPlacement {
    Internal,
    #[default]
    External,
}

/// Timing and sizing of the device session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub queue_capacity: usize,
    pub open_timeout_ms: u64,
    pub retry_delay_ms: u64,
    pub settle_delay_ms: u64,
    pub start_delay_ms: u64,
    pub queue_wait_ms: u64,
    /// Consecutive empty queue waits before the session restarts the
    /// stream on its own; `None` waits forever
    pub stall_timeouts: Option<u32>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            device: None,
            width: 1920,
            height: 1080,
            fps: 20,
            format: PixelFormat::Mjpeg,
            buffers: BufferPoolConfig::default(),
        }
    }
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            frame_buffers: 3, // triple buffering
            frame_size: 0,
            transfers: 3,
            transfer_size: 10 * 1024,
            placement: MemoryPlacement::External,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 3,
            open_timeout_ms: 5000,
            retry_delay_ms: 5000,
            settle_delay_ms: 2000,
            start_delay_ms: 100,
            queue_wait_ms: 5000,
            stall_timeouts: None,
        }
    }
}

impl SessionConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn start_delay(&self) -> Duration {
        Duration::from_millis(self.start_delay_ms)
    }

    pub fn queue_wait(&self) -> Duration {
        Duration::from_millis(self.queue_wait_ms)
    }
}

impl Config {
    /// Layers defaults, an optional TOML file and `UVCSTREAM__*` environment
    /// variables, then validates the result.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            if !path.exists() {
                return Err(UvcError::InvalidConfig(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            }
            builder = builder.add_source(config::File::from(path));
        }

        let config: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(UvcError::InvalidConfig(msg.to_string()));

        if self.session.queue_capacity == 0 {
            return invalid("session.queue_capacity must be at least 1");
        }
        if self.stream.buffers.frame_buffers == 0 {
            return invalid("stream.buffers.frame_buffers must be at least 1");
        }
        if self.stream.buffers.transfers == 0 {
            return invalid("stream.buffers.transfers must be at least 1");
        }
        if self.stream.fps == 0 {
            return invalid("stream.fps must be at least 1");
        }
        if self.stream.width == 0 || self.stream.height == 0 {
            return invalid("stream resolution must be non-zero");
        }
        if self.session.queue_wait_ms == 0 {
            return invalid("session.queue_wait_ms must be non-zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_values() {
        let config = Config::default();
        assert_eq!(config.stream.width, 1920);
        assert_eq!(config.stream.height, 1080);
        assert_eq!(config.stream.fps, 20);
        assert_eq!(config.stream.format, PixelFormat::Mjpeg);
        assert_eq!(config.stream.buffers.frame_buffers, 3);
        assert_eq!(config.stream.buffers.transfer_size, 10 * 1024);
        assert_eq!(config.session.queue_capacity, 3);
        assert_eq!(config.session.open_timeout(), Duration::from_secs(5));
        assert_eq!(config.session.retry_delay(), Duration::from_secs(5));
        assert_eq!(config.session.settle_delay(), Duration::from_secs(2));
        assert_eq!(config.session.queue_wait(), Duration::from_secs(5));
        assert!(config.session.stall_timeouts.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn load_merges_file_over_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "source = \"synthetic\"\n\
             [stream]\nwidth = 640\nheight = 480\nformat = \"h264\"\n\
             [session]\nqueue_capacity = 5\nstall_timeouts = 4"
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.source, SourceKind::Synthetic);
        assert_eq!(config.stream.width, 640);
        assert_eq!(config.stream.format, PixelFormat::H264);
        assert_eq!(config.stream.fps, 20);
        assert_eq!(config.session.queue_capacity, 5);
        assert_eq!(config.session.stall_timeouts, Some(4));
        assert_eq!(config.session.retry_delay_ms, 5000);
    }

    #[test]
    fn load_rejects_missing_file() {
        let err = Config::load(Some(Path::new("/nonexistent/uvcstream.toml"))).unwrap_err();
        assert!(matches!(err, UvcError::InvalidConfig(_)));
    }

    #[test]
    fn validate_rejects_zero_capacity() {
        let mut config = Config::default();
        config.session.queue_capacity = 0;
        assert!(matches!(config.validate(), Err(UvcError::InvalidConfig(_))));
    }
}
