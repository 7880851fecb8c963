use std::path::Path;

use tracing::{debug, info};
use v4l::{capability::Flags, video::Capture, Device, FourCC};

use crate::capture::frame::PixelFormat;

/// Highest /dev/videoN probed during discovery
const MAX_VIDEO_NODES: u32 = 64;

// Detected capture device info
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundDevice {
    pub path: String,
    pub card: String,
}

/// Whether the device at `path` captures video in `format`
pub fn supports_format(path: &str, format: PixelFormat) -> bool {
    let Ok(dev) = Device::with_path(path) else {
        return false;
    };
    let Ok(caps) = dev.query_caps() else {
        return false;
    };
    if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
        return false;
    }

    let wanted = FourCC::new(&format.fourcc());
    dev.enum_formats()
        .map(|formats| formats.iter().any(|fmt| fmt.fourcc == wanted))
        .unwrap_or(false)
}

/// Finds the first capture device offering `format`
pub fn find_capture_device(format: PixelFormat) -> Option<FoundDevice> {
    debug!(?format, "Scanning for capture devices");

    for i in 0..MAX_VIDEO_NODES {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() || !supports_format(&path, format) {
            continue;
        }

        let card = Device::with_path(&path)
            .and_then(|dev| dev.query_caps())
            .map(|caps| caps.card)
            .unwrap_or_default();
        info!("Found {:?} device: {} - {}", format, path, card);
        return Some(FoundDevice { path, card });
    }

    None
}
