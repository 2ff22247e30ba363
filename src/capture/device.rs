//! Kernel buffer-queue protocol as seen by the ring.

use std::time::Duration;

use super::CaptureError;

/// Kernel-side placement of one buffer, from `VIDIOC_QUERYBUF`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLayout {
    pub length: usize,
    pub offset: u64,
}

/// One buffer handed back by `VIDIOC_DQBUF`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dequeued {
    pub index: u32,
    pub sequence: u32,
    pub timestamp_us: u64,
    pub bytes_used: usize,
    /// Driver set the recoverable stream error flag on this buffer.
    pub recoverable_error: bool,
}

/// A streaming capture device with memory-mapped buffers.
///
/// Every call may come from the capture thread or, for
/// [`queue_buffer`](CaptureDevice::queue_buffer), from whichever thread drops a
/// descriptor. Implementations retry interrupted system calls themselves.
/// Dropping the device closes it.
pub trait CaptureDevice: Send + Sync + 'static {
    type Mapping: AsRef<[u8]> + Send + Sync + 'static;

    /// Ask the driver for `count` buffers; returns how many it granted.
    fn request_buffers(&self, count: u32) -> Result<u32, CaptureError>;

    fn query_buffer(&self, index: u32) -> Result<BufferLayout, CaptureError>;

    fn map_buffer(&self, index: u32, layout: BufferLayout) -> Result<Self::Mapping, CaptureError>;

    fn queue_buffer(&self, index: u32) -> Result<(), CaptureError>;

    fn stream_on(&self) -> Result<(), CaptureError>;

    fn stream_off(&self) -> Result<(), CaptureError>;

    /// Wait up to `timeout` for a filled buffer. `Ok(false)` means timeout.
    fn wait_readable(&self, timeout: Duration) -> Result<bool, CaptureError>;

    fn dequeue_buffer(&self) -> Result<Dequeued, CaptureError>;
}
