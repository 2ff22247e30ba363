pub mod device;
pub mod frame;
mod ring;
pub mod session;
pub mod status;
pub mod v4l2;

use std::io;

use thiserror::Error;

pub use device::{BufferLayout, CaptureDevice, Dequeued};
pub use frame::{CapturedFrame, PixelFormat};
pub use ring::BufferState;
pub use session::CaptureSession;
pub use status::CaptureStatus;
pub use v4l2::V4l2Device;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("unable to open {path}: {source}")]
    DeviceOpen { path: String, source: io::Error },

    #[error("VIDIOC_S_FMT failed: {0}")]
    Format(io::Error),

    #[error("VIDIOC_REQBUFS count={count} failed: {source}")]
    BufferRequest { count: u32, source: io::Error },

    #[error("driver granted {granted} buffers, requested {requested}")]
    BufferCountMismatch { requested: u32, granted: u32 },

    #[error("mapping buffer {index} failed: {source}")]
    Map { index: u32, source: io::Error },

    #[error("VIDIOC_QBUF i={index} failed: {source}")]
    Queue { index: u32, source: io::Error },

    #[error("{action} failed: {source}")]
    StreamControl {
        action: &'static str,
        source: io::Error,
    },

    #[error("poll failed: {0}")]
    Wait(io::Error),

    #[error("VIDIOC_DQBUF failed: {0}")]
    Dequeue(io::Error),

    #[error("driver returned buffer index {index}, ring has {count}")]
    InvalidIndex { index: u32, count: usize },

    #[error("failed to spawn capture thread: {0}")]
    Spawn(io::Error),

    #[error("{outstanding} buffers still held by the application after drain timeout")]
    DrainTimeout { outstanding: usize },
}
