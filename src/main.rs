//! kvmcap capture demo: capture frames, copy them into pooled encoder frames

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use flume::{bounded, TrySendError};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use kvmcap::{utils, CaptureSession, CapturedFrame, Config, FramePool, V4l2Device};

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("kvmcap=debug"));

    #[cfg(not(feature = "profiling"))]
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    #[cfg(feature = "profiling")]
    {
        use tracing_subscriber::prelude::*;
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_timer(tracing_subscriber::fmt::time::uptime()),
            )
            .with(tracing_tracy::TracyLayer::default())
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    init_tracing();

    info!("kvmcap launching...");

    // Load configuration
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let mut config = Config::load(config_path.as_deref())?;

    // Auto-detect capture device if needed
    if config.capture.device.is_empty() {
        let found = utils::auto_detect_device()
            .ok_or_else(|| eyre!("No suitable capture device found"))?;
        config.capture.device = found.path;
    }
    info!("Using capture device: {}", config.capture.device);

    let device = V4l2Device::open(&config.capture.device)?;
    if let Some(request) = &config.capture.format {
        device.set_format(request)?;
    }

    // Descriptors cross to the consumer; a full channel drops (and releases) the frame.
    let (tx, rx) = bounded::<CapturedFrame>(config.capture.buffer_count as usize);
    let mut session = CaptureSession::initialize(device, &config.capture, move |frame| {
        if let Err(TrySendError::Full(frame)) = tx.try_send(frame) {
            debug!(sequence = frame.sequence(), "consumer busy, dropping frame");
        }
    })?;

    let pool = FramePool::new();
    let pool_config = config.pool;
    let consumer = tokio::spawn(async move {
        while let Ok(frame) = rx.recv_async().await {
            match pool.allocate(pool_config.width, pool_config.height, pool_config.format) {
                Ok(mut pooled) => {
                    if let Some(luma) = Arc::get_mut(&mut pooled).and_then(|f| f.plane_mut(0)) {
                        let n = luma.len().min(frame.data().len());
                        luma[..n].copy_from_slice(&frame.data()[..n]);
                    }
                    pool.release(pooled);
                }
                Err(e) => warn!("Failed to get pooled frame: {}", e),
            }
            frame.release();
        }
        pool.stats()
    });

    let status = session.status();
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            res = &mut ctrl_c => {
                res?;
                break;
            }
            _ = ticker.tick() => {
                info!(
                    frames = status.frames_captured(),
                    stalled = status.is_stalled(),
                    stall_episodes = status.stall_episodes(),
                    "capture status"
                );
            }
        }
    }

    info!("kvmcap shutting down");
    tokio::task::spawn_blocking(move || session.shutdown()).await??;

    let stats = consumer.await?;
    info!(hits = stats.hits, allocations = stats.allocations, "frame pool");
    Ok(())
}
