//! Recycling pool of multi-plane frames sized for hardware encoder ingest.
//!
//! Reuse is last-in first-out and **does not look at the request**: a pooled
//! frame is handed back verbatim even if its dimensions or format differ from
//! what the caller asked for. Callers are expected to use one
//! `(width, height, format)` for the lifetime of a pool. Frames are never
//! returned to the allocator, so the pool grows to the peak number of frames
//! held at once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use metrics::{counter, gauge};
use thiserror::Error;
use tracing::{debug, error, info_span, Span};

use crate::PixelFormat;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("unsupported pool format {0:?}")]
    UnsupportedFormat(PixelFormat),

    #[error("invalid frame dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },
}

/// Encoder macroblock/stride alignment for width.
pub const WIDTH_ALIGN: u32 = 32;
/// Encoder alignment for height.
pub const HEIGHT_ALIGN: u32 = 16;

/// `value` rounded up to a multiple of `align`, or `None` if that overflows.
pub fn round_up(value: u32, align: u32) -> Option<u32> {
    value.checked_next_multiple_of(align)
}

/// One image plane inside a frame's allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plane {
    pub offset: usize,
    pub len: usize,
}

/// Aligned dimensions and plane lengths (luma first) for a fresh frame.
struct FrameLayout {
    width: u32,
    height: u32,
    lengths: Vec<usize>,
}

/// RGB uses the aligned dimensions; the planar YUV layouts size their planes
/// from the requested dimensions.
fn frame_layout(width: u32, height: u32, format: PixelFormat) -> Result<FrameLayout, PoolError> {
    let invalid = PoolError::InvalidDimensions { width, height };
    if width == 0 || height == 0 {
        return Err(invalid);
    }

    let aligned_w = round_up(width, WIDTH_ALIGN).ok_or(invalid.clone())?;
    let aligned_h = round_up(height, HEIGHT_ALIGN).ok_or(invalid.clone())?;
    let luma = (width as usize).checked_mul(height as usize).ok_or(invalid.clone())?;

    let lengths = match format {
        PixelFormat::Rgb24 => {
            let bytes = (aligned_w as usize)
                .checked_mul(aligned_h as usize)
                .and_then(|n| n.checked_mul(3))
                .ok_or(invalid)?;
            vec![bytes]
        }
        PixelFormat::Yuv420Planar => vec![luma, luma / 4, luma / 4],
        PixelFormat::Yuv422Planar => vec![luma, luma / 2, luma / 2],
        other => return Err(PoolError::UnsupportedFormat(other)),
    };

    Ok(FrameLayout {
        width: aligned_w,
        height: aligned_h,
        lengths,
    })
}

/// A pixel buffer with up to three planes in one aligned allocation.
pub struct PooledFrame {
    width: u32,
    height: u32,
    format: PixelFormat,
    planes: [Option<Plane>; 3],
    storage: Vec<u8>,
    base: usize,
}

impl PooledFrame {
    fn new(width: u32, height: u32, format: PixelFormat) -> Result<Self, PoolError> {
        let layout = frame_layout(width, height, format)?;
        let align = page_size::get();
        let padded = layout
            .lengths
            .iter()
            .try_fold(align, |acc, &len| acc.checked_add(len))
            .ok_or(PoolError::InvalidDimensions { width, height })?;
        let storage = vec![0u8; padded];
        let base = storage.as_ptr().align_offset(align);

        let mut planes = [None; 3];
        let mut offset = 0;
        for (slot, len) in planes.iter_mut().zip(layout.lengths) {
            *slot = Some(Plane { offset, len });
            offset += len;
        }
        debug_assert!(base + offset <= storage.len());

        Ok(Self {
            width: layout.width,
            height: layout.height,
            format,
            planes,
            storage,
            base,
        })
    }

    /// Width rounded up to [`WIDTH_ALIGN`].
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height rounded up to [`HEIGHT_ALIGN`].
    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn plane_count(&self) -> usize {
        self.planes.iter().flatten().count()
    }

    pub fn plane_layout(&self, index: usize) -> Option<Plane> {
        self.planes.get(index).copied().flatten()
    }

    pub fn plane(&self, index: usize) -> Option<&[u8]> {
        let plane = self.plane_layout(index)?;
        let start = self.base + plane.offset;
        self.storage.get(start..start + plane.len)
    }

    pub fn plane_mut(&mut self, index: usize) -> Option<&mut [u8]> {
        let plane = self.plane_layout(index)?;
        let start = self.base + plane.offset;
        self.storage.get_mut(start..start + plane.len)
    }

    /// All planes at once, for converters that write luma and chroma together.
    pub fn planes_mut(&mut self) -> Vec<&mut [u8]> {
        let mut rest = &mut self.storage[self.base..];
        let mut out = Vec::with_capacity(3);
        for plane in self.planes.iter().flatten() {
            let (head, tail) = std::mem::take(&mut rest).split_at_mut(plane.len);
            out.push(head);
            rest = tail;
        }
        out
    }

    /// Bytes covered by all planes, in layout order.
    pub fn byte_len(&self) -> usize {
        self.planes.iter().flatten().map(|p| p.len).sum()
    }

    /// Start of the allocation, aligned to the page size.
    pub fn as_bytes(&self) -> &[u8] {
        &self.storage[self.base..self.base + self.byte_len()]
    }
}

impl std::fmt::Debug for PooledFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("planes", &self.planes)
            .finish()
    }
}

/// Pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Requests served from the free list.
    pub hits: u64,
    /// Frames created because the free list was empty.
    pub allocations: u64,
    /// Frames currently waiting on the free list.
    pub free: usize,
}

struct PoolInner {
    freed: Mutex<Vec<Arc<PooledFrame>>>,
    hits: AtomicU64,
    allocations: AtomicU64,
    span: Span,
}

/// Thread-safe recycling allocator for [`PooledFrame`]s. Clones share one pool.
#[derive(Clone)]
pub struct FramePool {
    inner: Arc<PoolInner>,
}

impl Default for FramePool {
    fn default() -> Self {
        Self::new()
    }
}

impl FramePool {
    pub fn new() -> Self {
        Self::with_span(info_span!("frame_pool"))
    }

    /// Pool whose diagnostics are emitted under `span`.
    pub fn with_span(span: Span) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                freed: Mutex::new(Vec::new()),
                hits: AtomicU64::new(0),
                allocations: AtomicU64::new(0),
                span,
            }),
        }
    }

    /// Take the most recently released frame, or allocate a new one.
    ///
    /// A reused frame is returned as-is, whatever `width`, `height` and
    /// `format` say.
    pub fn allocate(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<Arc<PooledFrame>, PoolError> {
        let (reused, free) = {
            let mut freed = self.inner.freed.lock().unwrap_or_else(PoisonError::into_inner);
            let frame = freed.pop();
            (frame, freed.len())
        };
        if let Some(frame) = reused {
            self.inner.hits.fetch_add(1, Ordering::Relaxed);
            counter!("kvmcap_pool_hits_total").increment(1);
            gauge!("kvmcap_pool_free_frames").set(free as f64);
            return Ok(frame);
        }

        let frame = PooledFrame::new(width, height, format).map_err(|e| {
            error!(
                parent: &self.inner.span,
                width,
                height,
                ?format,
                error = %e,
                "frame allocation failed"
            );
            e
        })?;

        self.inner.allocations.fetch_add(1, Ordering::Relaxed);
        counter!("kvmcap_pool_allocations_total").increment(1);
        debug!(
            parent: &self.inner.span,
            width = frame.width(),
            height = frame.height(),
            ?format,
            bytes = frame.byte_len(),
            "allocated frame"
        );
        Ok(Arc::new(frame))
    }

    /// Put a frame back on the free list.
    pub fn release(&self, frame: Arc<PooledFrame>) {
        let free = {
            let mut freed = self.inner.freed.lock().unwrap_or_else(PoisonError::into_inner);
            freed.push(frame);
            freed.len()
        };
        gauge!("kvmcap_pool_free_frames").set(free as f64);
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            hits: self.inner.hits.load(Ordering::Relaxed),
            allocations: self.inner.allocations.load(Ordering::Relaxed),
            free: self
                .inner
                .freed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
        }
    }
}
