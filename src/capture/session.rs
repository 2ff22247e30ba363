//! Capture session: brings the ring up, runs the capture thread, drains on shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{error, info, info_span, instrument, warn, Span};

use super::ring::{BufferState, Ring};
use super::status::CaptureStatus;
use super::{CaptureDevice, CaptureError, CapturedFrame};
use crate::CaptureConfig;

#[derive(Debug, Clone, Copy)]
struct LoopTiming {
    poll_timeout: Duration,
    idle_sleep: Duration,
    stall_timeout: Duration,
}

/// A running capture session over one device.
///
/// The handler runs synchronously on the capture thread, so a slow handler
/// throttles capture. Each [`CapturedFrame`] it receives must eventually be
/// dropped or released, from any thread; [`shutdown`](Self::shutdown) waits
/// for that before unmapping anything.
pub struct CaptureSession<D: CaptureDevice> {
    ring: Option<Arc<Ring<D>>>,
    worker: Option<JoinHandle<()>>,
    terminate: Arc<AtomicBool>,
    status: CaptureStatus,
    drain_cadence: Duration,
    drain_timeout: Option<Duration>,
    span: Span,
}

impl<D: CaptureDevice> CaptureSession<D> {
    /// Start capturing from `device`, logging under a `capture` span.
    pub fn initialize<H>(
        device: D,
        config: &CaptureConfig,
        handler: H,
    ) -> Result<Self, CaptureError>
    where
        H: FnMut(CapturedFrame) + Send + 'static,
    {
        let span = info_span!("capture", device = %config.device);
        Self::initialize_in(device, config, handler, span)
    }

    /// Start capturing, emitting all session events under `span`.
    ///
    /// Any failure unwinds completely: no buffer stays mapped, streaming is
    /// stopped and the device is closed before the error is returned.
    pub fn initialize_in<H>(
        device: D,
        config: &CaptureConfig,
        handler: H,
        span: Span,
    ) -> Result<Self, CaptureError>
    where
        H: FnMut(CapturedFrame) + Send + 'static,
    {
        let status = CaptureStatus::default();
        let ring = Ring::bring_up(device, config.buffer_count, status.clone(), span.clone())?;

        span.in_scope(|| info!("STREAMON"));
        if let Err(e) = ring.device().stream_on() {
            span.in_scope(|| error!(error = %e, "failed to start streaming"));
            ring.teardown();
            return Err(e);
        }

        let terminate = Arc::new(AtomicBool::new(false));
        let timing = LoopTiming {
            poll_timeout: config.poll_timeout(),
            idle_sleep: config.idle_sleep(),
            stall_timeout: config.stall_timeout(),
        };

        let worker = {
            let ring = ring.clone();
            let terminate = terminate.clone();
            let status = status.clone();
            let span = span.clone();
            let cpu = config.cpu_affinity;
            thread::Builder::new()
                .name("capture".into())
                .spawn(move || run_loop(ring, handler, terminate, status, timing, cpu, span))
        };

        let worker = match worker {
            Ok(worker) => worker,
            Err(e) => {
                span.in_scope(|| error!(error = %e, "failed to spawn capture thread"));
                if let Err(e) = ring.device().stream_off() {
                    span.in_scope(|| error!(error = %e, "STREAMOFF failed during rollback"));
                }
                ring.teardown();
                return Err(CaptureError::Spawn(e));
            }
        };

        Ok(Self {
            ring: Some(ring),
            worker: Some(worker),
            terminate,
            status,
            drain_cadence: config.drain_poll(),
            drain_timeout: config.drain_timeout(),
            span,
        })
    }

    /// Stop the capture thread, wait for every descriptor to come back, then
    /// unmap and release the ring. Calling it again is a no-op.
    ///
    /// Blocks indefinitely while a descriptor is held unless the config set a
    /// drain timeout.
    #[instrument(parent = &self.span, skip(self))]
    pub fn shutdown(&mut self) -> Result<(), CaptureError> {
        let Some(ring) = self.ring.take() else {
            return Ok(());
        };

        self.terminate.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("capture thread panicked");
            }
        }

        info!("STREAMOFF");
        let mut result = ring.device().stream_off().map_err(|e| {
            error!(error = %e, "failed to stop streaming");
            e
        });

        if let Err(e) = ring.wait_drained(self.drain_cadence, self.drain_timeout) {
            result = result.and(Err(e));
        }

        ring.teardown();
        info!("capture session closed");
        result
    }

    /// Health handle for external monitors.
    pub fn status(&self) -> CaptureStatus {
        self.status.clone()
    }

    pub fn buffer_count(&self) -> usize {
        self.ring.as_ref().map_or(0, |ring| ring.len())
    }

    /// State of one ring buffer, or `None` after shutdown or for a bad index.
    pub fn buffer_state(&self, index: usize) -> Option<BufferState> {
        self.ring.as_ref().and_then(|ring| ring.state(index))
    }

    pub fn app_owned_count(&self) -> usize {
        self.ring.as_ref().map_or(0, |ring| ring.app_owned_count())
    }

    pub fn is_running(&self) -> bool {
        self.ring.is_some()
    }
}

impl<D: CaptureDevice> Drop for CaptureSession<D> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            self.span.in_scope(|| error!(error = %e, "shutdown on drop failed"));
        }
    }
}

fn run_loop<D, H>(
    ring: Arc<Ring<D>>,
    mut handler: H,
    terminate: Arc<AtomicBool>,
    status: CaptureStatus,
    timing: LoopTiming,
    cpu: Option<usize>,
    span: Span,
) where
    D: CaptureDevice,
    H: FnMut(CapturedFrame),
{
    let _entered = span.enter();

    if let Some(id) = cpu {
        if !core_affinity::set_for_current(core_affinity::CoreId { id }) {
            warn!(cpu = id, "failed to pin capture thread");
        }
    }

    info!("capture loop started");
    let mut last_frame = Instant::now();

    while !terminate.load(Ordering::Acquire) {
        let frame = ring.acquire(timing.poll_timeout).unwrap_or_else(|e| {
            error!(error = %e, "frame acquisition failed");
            None
        });

        match frame {
            Some(frame) => {
                last_frame = Instant::now();
                if status.record_frame() {
                    info!("camera is producing frames again");
                }
                handler(frame);
            }
            None => {
                if last_frame.elapsed() > timing.stall_timeout
                    && !terminate.load(Ordering::Acquire)
                    && status.record_stall()
                {
                    error!(
                        stalled_ms = last_frame.elapsed().as_millis() as u64,
                        "camera has not been producing frames"
                    );
                }
                thread::sleep(timing.idle_sleep);
            }
        }
    }

    info!("capture loop terminated");
}
