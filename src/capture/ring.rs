//! Fixed set of kernel-mapped buffers and their ownership state.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;
use tracing::{debug, error, info, warn, Span};

use super::frame::{BufferReturn, CapturedFrame, MappedRegion};
use super::status::CaptureStatus;
use super::{CaptureDevice, CaptureError};

/// Who owns a ring buffer right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BufferState {
    /// Mapped but never handed to the driver, or dropped out of rotation
    /// after a failed re-queue.
    Free = 0,
    /// In the driver's queue.
    Queued = 1,
    /// Held by exactly one outstanding descriptor.
    AppOwned = 2,
}

impl BufferState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => BufferState::Queued,
            2 => BufferState::AppOwned,
            _ => BufferState::Free,
        }
    }
}

pub(crate) struct Ring<D: CaptureDevice> {
    device: D,
    states: Box<[CachePadded<AtomicU8>]>,
    regions: Mutex<Vec<Arc<D::Mapping>>>,
    drain_lock: Mutex<()>,
    drained: Condvar,
    torn_down: AtomicBool,
    status: CaptureStatus,
    span: Span,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<D: CaptureDevice> Ring<D> {
    /// Request, map and queue `count` buffers.
    ///
    /// On failure everything mapped so far is unmapped, the kernel allocation is
    /// released and the device is closed before the error is returned.
    pub(crate) fn bring_up(
        device: D,
        count: u32,
        status: CaptureStatus,
        span: Span,
    ) -> Result<Arc<Self>, CaptureError> {
        let _entered = span.enter();
        info!(count, "REQBUFS");

        let granted = device.request_buffers(count)?;
        if granted != count {
            error!(granted, requested = count, "driver did not grant the requested buffers");
            release_kernel_buffers(&device);
            return Err(CaptureError::BufferCountMismatch {
                requested: count,
                granted,
            });
        }

        let mut regions = Vec::with_capacity(count as usize);
        for index in 0..count {
            let mapped = device
                .query_buffer(index)
                .and_then(|layout| device.map_buffer(index, layout));
            match mapped {
                Ok(region) => regions.push(Arc::new(region)),
                Err(e) => {
                    error!(index, error = %e, "buffer setup failed");
                    drop(regions);
                    release_kernel_buffers(&device);
                    return Err(e);
                }
            }
        }

        drop(_entered);

        let ring = Arc::new(Self {
            device,
            states: (0..count)
                .map(|_| CachePadded::new(AtomicU8::new(BufferState::Free as u8)))
                .collect(),
            regions: Mutex::new(regions),
            drain_lock: Mutex::new(()),
            drained: Condvar::new(),
            torn_down: AtomicBool::new(false),
            status,
            span,
        });

        for index in 0..count {
            if let Err(e) = ring.queue_initial(index) {
                ring.teardown();
                return Err(e);
            }
        }

        Ok(ring)
    }

    pub(crate) fn device(&self) -> &D {
        &self.device
    }

    pub(crate) fn len(&self) -> usize {
        self.states.len()
    }

    pub(crate) fn state(&self, index: usize) -> Option<BufferState> {
        self.states
            .get(index)
            .map(|slot| BufferState::from_raw(slot.load(Ordering::Acquire)))
    }

    pub(crate) fn app_owned_count(&self) -> usize {
        self.states
            .iter()
            .filter(|slot| slot.load(Ordering::Acquire) == BufferState::AppOwned as u8)
            .count()
    }

    fn queue_initial(&self, index: u32) -> Result<(), CaptureError> {
        let slot = &self.states[index as usize];
        slot.store(BufferState::Queued as u8, Ordering::Release);
        if let Err(e) = self.device.queue_buffer(index) {
            error!(parent: &self.span, index, error = %e, "initial queue failed");
            slot.store(BufferState::Free as u8, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }

    /// Wait for one filled buffer and wrap it in a descriptor.
    ///
    /// `Ok(None)` means the wait timed out.
    pub(crate) fn acquire(
        self: &Arc<Self>,
        timeout: Duration,
    ) -> Result<Option<CapturedFrame>, CaptureError> {
        if !self.device.wait_readable(timeout)? {
            return Ok(None);
        }

        let dequeued = self.device.dequeue_buffer()?;
        let index = dequeued.index as usize;
        if index >= self.states.len() {
            return Err(CaptureError::InvalidIndex {
                index: dequeued.index,
                count: self.states.len(),
            });
        }

        if dequeued.recoverable_error {
            warn!(parent: &self.span, index, "V4L2 reported a recoverable streaming error");
            self.status.record_recoverable_error();
        }

        let region: Arc<MappedRegion> = match lock(&self.regions).get(index) {
            Some(region) => region.clone(),
            None => {
                return Err(CaptureError::InvalidIndex {
                    index: dequeued.index,
                    count: 0,
                })
            }
        };

        let previous = self.states[index].swap(BufferState::AppOwned as u8, Ordering::AcqRel);
        if previous != BufferState::Queued as u8 {
            error!(
                parent: &self.span,
                index,
                state = ?BufferState::from_raw(previous),
                "driver returned a buffer that was not queued"
            );
        }
        self.status.record_app_owned(self.app_owned_count());

        let ring: Arc<dyn BufferReturn> = self.clone();
        Ok(Some(CapturedFrame::new(
            dequeued.sequence,
            dequeued.timestamp_us,
            dequeued.index,
            dequeued.bytes_used,
            region,
            ring,
        )))
    }

    /// Block until no buffer is application-owned.
    ///
    /// Re-checks on every release and at least every `cadence`. With no
    /// `timeout` this waits indefinitely.
    pub(crate) fn wait_drained(
        &self,
        cadence: Duration,
        timeout: Option<Duration>,
    ) -> Result<(), CaptureError> {
        let started = Instant::now();
        let mut guard = lock(&self.drain_lock);
        loop {
            let outstanding = self.app_owned_count();
            if outstanding == 0 {
                info!(parent: &self.span, "application has returned all buffers");
                return Ok(());
            }

            let mut wait = cadence;
            if let Some(limit) = timeout {
                let remaining = limit.saturating_sub(started.elapsed());
                if remaining.is_zero() {
                    error!(parent: &self.span, outstanding, "gave up waiting for buffers");
                    return Err(CaptureError::DrainTimeout { outstanding });
                }
                wait = wait.min(remaining);
            }

            warn!(
                parent: &self.span,
                outstanding,
                "waiting for buffers to be returned by application"
            );
            self.status.record_drain_wait(outstanding);
            guard = self
                .drained
                .wait_timeout(guard, wait)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Unmap every buffer and release the kernel allocation.
    ///
    /// Callers drain first; a descriptor that outlives a timed-out drain keeps
    /// its own mapping reference alive. Holds the drain lock throughout so no
    /// release can issue QBUF around REQBUFS(0).
    pub(crate) fn teardown(&self) {
        let _guard = lock(&self.drain_lock);
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(parent: &self.span, "unmapping buffers");
        let regions = std::mem::take(&mut *lock(&self.regions));
        drop(regions);
        let _entered = self.span.enter();
        release_kernel_buffers(&self.device);
    }
}

impl<D: CaptureDevice> BufferReturn for Ring<D> {
    /// The state flip and QBUF happen under the drain lock, so a drain that
    /// sees zero outstanding buffers never races a re-queue still in flight.
    fn return_buffer(&self, index: u32) {
        let Some(slot) = self.states.get(index as usize) else {
            error!(parent: &self.span, index, "release of unknown buffer index");
            return;
        };

        let guard = lock(&self.drain_lock);
        if let Err(previous) = slot.compare_exchange(
            BufferState::AppOwned as u8,
            BufferState::Queued as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            drop(guard);
            error!(
                parent: &self.span,
                index,
                state = ?BufferState::from_raw(previous),
                "double queue"
            );
            return;
        }

        if self.torn_down.load(Ordering::Acquire) {
            debug!(parent: &self.span, index, "buffer released after teardown");
        } else if let Err(e) = self.device.queue_buffer(index) {
            error!(
                parent: &self.span,
                index,
                error = %e,
                "re-queue failed, buffer leaves rotation"
            );
            slot.store(BufferState::Free as u8, Ordering::Release);
        }
        self.status.record_app_owned(self.app_owned_count());

        drop(guard);
        self.drained.notify_all();
    }
}

fn release_kernel_buffers<D: CaptureDevice>(device: &D) {
    info!("REQBUFS 0");
    if let Err(e) = device.request_buffers(0) {
        error!(error = %e, "failed to release kernel buffers");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{BufferLayout, Dequeued};
    use crate::testing::GaugeRecorder;
    use std::collections::VecDeque;
    use std::io;

    #[derive(Default)]
    struct Loopback {
        queued: Mutex<Vec<u32>>,
        pending: Mutex<VecDeque<u32>>,
        fail_queue: AtomicBool,
        released: AtomicBool,
    }

    impl CaptureDevice for Loopback {
        type Mapping = Vec<u8>;

        fn request_buffers(&self, count: u32) -> Result<u32, CaptureError> {
            if count == 0 {
                self.released.store(true, Ordering::SeqCst);
            }
            Ok(count)
        }

        fn query_buffer(&self, _index: u32) -> Result<BufferLayout, CaptureError> {
            Ok(BufferLayout {
                length: 64,
                offset: 0,
            })
        }

        fn map_buffer(&self, index: u32, layout: BufferLayout) -> Result<Vec<u8>, CaptureError> {
            Ok(vec![index as u8; layout.length])
        }

        fn queue_buffer(&self, index: u32) -> Result<(), CaptureError> {
            if self.fail_queue.load(Ordering::SeqCst) || self.released.load(Ordering::SeqCst) {
                return Err(CaptureError::Queue {
                    index,
                    source: io::Error::from(io::ErrorKind::InvalidInput),
                });
            }
            lock(&self.queued).push(index);
            Ok(())
        }

        fn stream_on(&self) -> Result<(), CaptureError> {
            Ok(())
        }

        fn stream_off(&self) -> Result<(), CaptureError> {
            Ok(())
        }

        fn wait_readable(&self, _timeout: Duration) -> Result<bool, CaptureError> {
            Ok(!lock(&self.pending).is_empty())
        }

        fn dequeue_buffer(&self) -> Result<Dequeued, CaptureError> {
            let index = lock(&self.pending)
                .pop_front()
                .ok_or_else(|| CaptureError::Dequeue(io::Error::from(io::ErrorKind::WouldBlock)))?;
            Ok(Dequeued {
                index,
                sequence: index + 100,
                timestamp_us: 0,
                bytes_used: 8,
                recoverable_error: false,
            })
        }
    }

    fn ring(count: u32) -> Arc<Ring<Loopback>> {
        Ring::bring_up(Loopback::default(), count, CaptureStatus::default(), Span::none()).unwrap()
    }

    fn acquire(ring: &Arc<Ring<Loopback>>, index: u32) -> CapturedFrame {
        lock(&ring.device.pending).push_back(index);
        ring.acquire(Duration::ZERO).unwrap().unwrap()
    }

    #[test]
    fn test_bring_up_queues_every_buffer() {
        let ring = ring(4);
        assert_eq!(*lock(&ring.device.queued), vec![0, 1, 2, 3]);
        assert!((0..4).all(|i| ring.state(i) == Some(BufferState::Queued)));
        assert_eq!(ring.state(4), None);
    }

    #[test]
    fn test_timeout_yields_no_frame() {
        let ring = ring(2);
        assert!(ring.acquire(Duration::ZERO).unwrap().is_none());
    }

    #[test]
    fn test_double_queue_keeps_single_state() {
        let ring = ring(4);
        let frame = acquire(&ring, 1);
        assert_eq!(frame.sequence(), 101);
        assert_eq!(ring.state(1), Some(BufferState::AppOwned));

        frame.release();
        assert_eq!(ring.state(1), Some(BufferState::Queued));

        ring.return_buffer(1);
        ring.return_buffer(1);
        assert_eq!(ring.state(1), Some(BufferState::Queued));
        assert_eq!(ring.app_owned_count(), 0);
        assert_eq!(lock(&ring.device.queued).iter().filter(|&&i| i == 1).count(), 2);
    }

    #[test]
    fn test_unknown_index_release_is_ignored() {
        let ring = ring(2);
        ring.return_buffer(7);
        assert_eq!(ring.app_owned_count(), 0);
    }

    #[test]
    fn test_failed_requeue_takes_buffer_out_of_rotation() {
        let ring = ring(2);
        let frame = acquire(&ring, 0);

        ring.device.fail_queue.store(true, Ordering::SeqCst);
        frame.release();

        assert_eq!(ring.state(0), Some(BufferState::Free));
        assert_eq!(ring.app_owned_count(), 0);
        ring.wait_drained(Duration::from_millis(10), Some(Duration::from_millis(10)))
            .unwrap();
    }

    #[test]
    fn test_drain_wakes_on_release() {
        let ring = ring(2);
        let frame = acquire(&ring, 1);

        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            frame.release();
        });

        let started = Instant::now();
        ring.wait_drained(Duration::from_secs(10), None).unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(ring.status.drain_waits() >= 1);
        releaser.join().unwrap();
    }

    #[test]
    fn test_release_racing_shutdown_never_queues_after_reqbufs0() {
        for _ in 0..200 {
            let ring = ring(2);
            let frame = acquire(&ring, 0);

            let releaser = std::thread::spawn(move || frame.release());
            ring.wait_drained(Duration::from_millis(1), None).unwrap();
            ring.teardown();
            releaser.join().unwrap();

            assert_eq!(ring.state(0), Some(BufferState::Queued));
            assert_eq!(lock(&ring.device.queued).iter().filter(|&&i| i == 0).count(), 2);
        }
    }

    #[test]
    fn test_release_after_teardown_skips_qbuf() {
        let ring = ring(2);
        let frame = acquire(&ring, 1);
        ring.teardown();

        frame.release();
        assert_eq!(ring.state(1), Some(BufferState::Queued));
        assert_eq!(lock(&ring.device.queued).iter().filter(|&&i| i == 1).count(), 1);
    }

    #[test]
    fn test_app_owned_gauge_tracks_every_transition() {
        let recorder = GaugeRecorder::default();
        metrics::with_local_recorder(&recorder, || {
            let ring = ring(4);
            let first = acquire(&ring, 0);
            let second = acquire(&ring, 3);
            assert_eq!(recorder.value("kvmcap_buffers_app_owned"), Some(2.0));

            first.release();
            assert_eq!(recorder.value("kvmcap_buffers_app_owned"), Some(1.0));
            second.release();
            assert_eq!(recorder.value("kvmcap_buffers_app_owned"), Some(0.0));
        });
    }
}
