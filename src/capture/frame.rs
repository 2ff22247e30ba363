use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Read-only view of one kernel-mapped ring buffer.
pub type MappedRegion = dyn AsRef<[u8]> + Send + Sync;

/// Implemented by the ring so a descriptor can hand its buffer back from any thread.
pub(crate) trait BufferReturn: Send + Sync {
    fn return_buffer(&self, index: u32);
}

/// Pixel formats we know about.
///
/// `Yuyv` and `Mjpeg` are capture-side formats; the frame pool only lays out
/// `Rgb24`, `Yuv420Planar` and `Yuv422Planar`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    Yuv420Planar,
    Yuv422Planar,
    Yuyv,
    Mjpeg,
}

impl PixelFormat {
    /// V4L2 fourcc for this format.
    pub fn fourcc(self) -> &'static [u8; 4] {
        match self {
            PixelFormat::Rgb24 => b"RGB3",
            PixelFormat::Yuv420Planar => b"YU12",
            PixelFormat::Yuv422Planar => b"422P",
            PixelFormat::Yuyv => b"YUYV",
            PixelFormat::Mjpeg => b"MJPG",
        }
    }

    pub fn from_fourcc(code: &[u8; 4]) -> Option<Self> {
        match code {
            b"RGB3" => Some(PixelFormat::Rgb24),
            b"YU12" => Some(PixelFormat::Yuv420Planar),
            b"422P" => Some(PixelFormat::Yuv422Planar),
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"MJPG" => Some(PixelFormat::Mjpeg),
            _ => None,
        }
    }
}

/// One dequeued ring buffer, borrowed from the kernel.
///
/// The image bytes live in the ring's mapping. Dropping the descriptor (or
/// calling [`CapturedFrame::release`]) hands the buffer back to the driver
/// queue, so release happens exactly once and the data cannot be touched
/// afterwards. Holding a descriptor blocks `CaptureSession::shutdown`.
pub struct CapturedFrame {
    sequence: u32,
    timestamp_us: u64,
    index: u32,
    len: usize,
    image: Option<Arc<MappedRegion>>,
    ring: Arc<dyn BufferReturn>,
}

impl CapturedFrame {
    pub(crate) fn new(
        sequence: u32,
        timestamp_us: u64,
        index: u32,
        len: usize,
        image: Arc<MappedRegion>,
        ring: Arc<dyn BufferReturn>,
    ) -> Self {
        Self {
            sequence,
            timestamp_us,
            index,
            len,
            image: Some(image),
            ring,
        }
    }

    /// Driver-assigned frame sequence number.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Capture timestamp in microseconds, as reported by the driver.
    pub fn timestamp_us(&self) -> u64 {
        self.timestamp_us
    }

    /// Ring index this descriptor holds.
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Image bytes, clamped to the mapped length.
    pub fn data(&self) -> &[u8] {
        match &self.image {
            Some(region) => {
                let bytes = (**region).as_ref();
                &bytes[..self.len.min(bytes.len())]
            }
            None => &[],
        }
    }

    /// Return the buffer to the driver queue.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for CapturedFrame {
    fn drop(&mut self) {
        // The mapping reference goes first so a drained ring holds the only one.
        self.image.take();
        self.ring.return_buffer(self.index);
    }
}

impl fmt::Debug for CapturedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapturedFrame")
            .field("sequence", &self.sequence)
            .field("timestamp_us", &self.timestamp_us)
            .field("index", &self.index)
            .field("len", &self.len)
            .finish()
    }
}
