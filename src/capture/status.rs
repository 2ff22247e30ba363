//! Capture health shared between the capture thread and external monitors.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use metrics::{counter, gauge};

#[derive(Debug, Default)]
struct StatusInner {
    stalled: AtomicBool,
    stall_episodes: AtomicU64,
    frames_captured: AtomicU64,
    recoverable_errors: AtomicU64,
    drain_waits: AtomicU64,
}

/// Cloneable read handle onto a capture session's health.
#[derive(Debug, Clone, Default)]
pub struct CaptureStatus {
    inner: Arc<StatusInner>,
}

impl CaptureStatus {
    /// Sticky watchdog flag: set when no frame arrived within the stall
    /// timeout, cleared by the next successful dequeue.
    pub fn is_stalled(&self) -> bool {
        self.inner.stalled.load(Ordering::Acquire)
    }

    /// Number of distinct stall episodes observed.
    pub fn stall_episodes(&self) -> u64 {
        self.inner.stall_episodes.load(Ordering::Relaxed)
    }

    pub fn frames_captured(&self) -> u64 {
        self.inner.frames_captured.load(Ordering::Relaxed)
    }

    /// Buffers the driver flagged with a recoverable stream error.
    pub fn recoverable_errors(&self) -> u64 {
        self.inner.recoverable_errors.load(Ordering::Relaxed)
    }

    /// Wait cycles spent by shutdown for buffers held by the application.
    pub fn drain_waits(&self) -> u64 {
        self.inner.drain_waits.load(Ordering::Relaxed)
    }

    /// Returns true if this frame ended a stall episode.
    pub(crate) fn record_frame(&self) -> bool {
        self.inner.frames_captured.fetch_add(1, Ordering::Relaxed);
        counter!("kvmcap_frames_captured_total").increment(1);
        self.inner.stalled.swap(false, Ordering::AcqRel)
    }

    /// Returns true if this starts a new stall episode.
    pub(crate) fn record_stall(&self) -> bool {
        if self.inner.stalled.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.inner.stall_episodes.fetch_add(1, Ordering::Relaxed);
        counter!("kvmcap_capture_stalls_total").increment(1);
        true
    }

    pub(crate) fn record_recoverable_error(&self) {
        self.inner.recoverable_errors.fetch_add(1, Ordering::Relaxed);
        counter!("kvmcap_recoverable_stream_errors_total").increment(1);
    }

    pub(crate) fn record_drain_wait(&self, outstanding: usize) {
        self.inner.drain_waits.fetch_add(1, Ordering::Relaxed);
        self.record_app_owned(outstanding);
    }

    pub(crate) fn record_app_owned(&self, outstanding: usize) {
        gauge!("kvmcap_buffers_app_owned").set(outstanding as f64);
    }
}
