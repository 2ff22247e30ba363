//! V4L2 capture device with memory-mapped streaming buffers

use std::io;
use std::os::fd::{BorrowedFd, RawFd};
use std::os::raw::c_void;
use std::time::Duration;

use memmap2::{MmapMut, MmapOptions};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, info, instrument};
use v4l::buffer::{Flags as BufFlags, Type};
use v4l::capability::Flags as CapFlags;
use v4l::memory::Memory;
use v4l::v4l2::{self, vidioc};
use v4l::v4l_sys::{v4l2_buffer, v4l2_requestbuffers};
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::{BufferLayout, CaptureDevice, CaptureError, Dequeued};
use crate::FormatRequest;

/// Retry a driver call until it is not interrupted by a signal.
fn retry_eintr<T>(mut call: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    loop {
        match call() {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

fn new_buffer(index: u32) -> v4l2_buffer {
    // SAFETY: v4l2_buffer is a plain C struct; all-zero is a valid value.
    let mut buf: v4l2_buffer = unsafe { std::mem::zeroed() };
    buf.type_ = Type::VideoCapture as u32;
    buf.memory = Memory::Mmap as u32;
    buf.index = index;
    buf
}

/// A V4L2 video capture node.
pub struct V4l2Device {
    device: Device,
    fd: RawFd,
    path: String,
}

impl V4l2Device {
    /// Open a capture node. `v4l` opens it `O_RDWR | O_NONBLOCK`.
    #[instrument]
    pub fn open(path: &str) -> Result<Self, CaptureError> {
        let open_err = |source| CaptureError::DeviceOpen {
            path: path.to_string(),
            source,
        };

        let device = Device::with_path(path).map_err(open_err)?;
        let caps = device.query_caps().map_err(open_err)?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE)
            || !caps.capabilities.contains(CapFlags::STREAMING)
        {
            return Err(open_err(io::Error::other(
                "device does not support streaming video capture",
            )));
        }

        let fd = device.handle().fd();
        Ok(Self {
            device,
            fd,
            path: path.to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Negotiate the capture format. The driver may adjust the request; the
    /// format it settled on is logged.
    #[instrument(skip(self), fields(path = %self.path))]
    pub fn set_format(&self, request: &FormatRequest) -> Result<(), CaptureError> {
        let mut fmt = self.device.format().map_err(CaptureError::Format)?;
        fmt.width = request.width;
        fmt.height = request.height;
        fmt.fourcc = FourCC::new(request.pixel_format.fourcc());

        let applied = self.device.set_format(&fmt).map_err(CaptureError::Format)?;
        info!(
            width = applied.width,
            height = applied.height,
            fourcc = %applied.fourcc,
            "capture format set"
        );
        Ok(())
    }

    fn stream_control(&self, request_on: bool) -> io::Result<()> {
        let mut buf_type = Type::VideoCapture as u32;
        let request = if request_on {
            vidioc::VIDIOC_STREAMON
        } else {
            vidioc::VIDIOC_STREAMOFF
        };
        retry_eintr(|| unsafe {
            v4l2::ioctl(self.fd, request, &mut buf_type as *mut u32 as *mut c_void)
        })
    }
}

impl CaptureDevice for V4l2Device {
    type Mapping = MmapMut;

    fn request_buffers(&self, count: u32) -> Result<u32, CaptureError> {
        // SAFETY: plain C struct, zero-initialised.
        let mut rb: v4l2_requestbuffers = unsafe { std::mem::zeroed() };
        rb.count = count;
        rb.type_ = Type::VideoCapture as u32;
        rb.memory = Memory::Mmap as u32;

        retry_eintr(|| unsafe {
            v4l2::ioctl(
                self.fd,
                vidioc::VIDIOC_REQBUFS,
                &mut rb as *mut v4l2_requestbuffers as *mut c_void,
            )
        })
        .map_err(|source| CaptureError::BufferRequest { count, source })?;

        Ok(rb.count)
    }

    fn query_buffer(&self, index: u32) -> Result<BufferLayout, CaptureError> {
        let mut buf = new_buffer(index);
        retry_eintr(|| unsafe {
            v4l2::ioctl(
                self.fd,
                vidioc::VIDIOC_QUERYBUF,
                &mut buf as *mut v4l2_buffer as *mut c_void,
            )
        })
        .map_err(|source| CaptureError::Map { index, source })?;

        // SAFETY: the driver fills `m.offset` for MMAP buffers.
        let offset = unsafe { buf.m.offset };
        Ok(BufferLayout {
            length: buf.length as usize,
            offset: u64::from(offset),
        })
    }

    fn map_buffer(&self, index: u32, layout: BufferLayout) -> Result<MmapMut, CaptureError> {
        debug!(index, length = layout.length, offset = layout.offset, "mmap");
        // SAFETY: the region is owned by the driver for this fd; the ring keeps
        // it mapped until every descriptor referencing it has been dropped.
        unsafe {
            MmapOptions::new()
                .offset(layout.offset)
                .len(layout.length)
                .map_mut(self.fd)
        }
        .map_err(|source| CaptureError::Map { index, source })
    }

    fn queue_buffer(&self, index: u32) -> Result<(), CaptureError> {
        let mut buf = new_buffer(index);
        retry_eintr(|| unsafe {
            v4l2::ioctl(
                self.fd,
                vidioc::VIDIOC_QBUF,
                &mut buf as *mut v4l2_buffer as *mut c_void,
            )
        })
        .map_err(|source| CaptureError::Queue { index, source })
    }

    fn stream_on(&self) -> Result<(), CaptureError> {
        self.stream_control(true)
            .map_err(|source| CaptureError::StreamControl {
                action: "VIDIOC_STREAMON",
                source,
            })
    }

    fn stream_off(&self) -> Result<(), CaptureError> {
        self.stream_control(false)
            .map_err(|source| CaptureError::StreamControl {
                action: "VIDIOC_STREAMOFF",
                source,
            })
    }

    fn wait_readable(&self, timeout: Duration) -> Result<bool, CaptureError> {
        // SAFETY: `self.device` owns the descriptor for as long as `self` lives.
        let fd = unsafe { BorrowedFd::borrow_raw(self.fd) };
        let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);

        let ready = retry_eintr(|| {
            let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
            poll(&mut fds, PollTimeout::from(millis)).map_err(io::Error::from)
        })
        .map_err(CaptureError::Wait)?;

        Ok(ready > 0)
    }

    fn dequeue_buffer(&self) -> Result<Dequeued, CaptureError> {
        let mut buf = new_buffer(0);
        retry_eintr(|| unsafe {
            v4l2::ioctl(
                self.fd,
                vidioc::VIDIOC_DQBUF,
                &mut buf as *mut v4l2_buffer as *mut c_void,
            )
        })
        .map_err(CaptureError::Dequeue)?;

        let timestamp_us = (buf.timestamp.tv_sec as u64)
            .saturating_mul(1_000_000)
            .saturating_add(buf.timestamp.tv_usec as u64);

        Ok(Dequeued {
            index: buf.index,
            sequence: buf.sequence,
            timestamp_us,
            bytes_used: buf.bytesused as usize,
            recoverable_error: BufFlags::from(buf.flags).contains(BufFlags::ERROR),
        })
    }
}
