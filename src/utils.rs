use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use v4l::{capability::Flags, video::Capture, Device};

use crate::capture::frame::PixelFormat;

/// Number of `/dev/videoN` nodes probed by [`auto_detect_device`].
const PROBE_NODES: u32 = 10;

// Detected capture device info
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoundDevice {
    pub path: String,
    pub card: String,
    /// First advertised format we recognise, if any.
    pub format: Option<PixelFormat>,
}

/// Find the first streaming capture node under `/dev/video0..9`.
pub fn auto_detect_device() -> Option<FoundDevice> {
    info!("Auto-detecting capture devices...");

    for i in 0..PROBE_NODES {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }

        let Ok(dev) = Device::with_path(&path) else {
            debug!(%path, "unable to open");
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE)
            || !caps.capabilities.contains(Flags::STREAMING)
        {
            continue;
        }

        let format = dev
            .enum_formats()
            .unwrap_or_default()
            .iter()
            .find_map(|desc| PixelFormat::from_fourcc(&desc.fourcc.repr));

        info!("Found capture device: {} - {} ({:?})", path, caps.card, format);
        return Some(FoundDevice {
            path,
            card: caps.card,
            format,
        });
    }

    None
}
