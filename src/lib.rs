pub mod capture;
pub mod cipher;
pub mod encode;
pub mod pipeline;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use capture::{CaptureSession, CaptureStatus, CapturedFrame, PixelFormat, V4l2Device};
pub use encode::EncoderSettings;
pub use pipeline::{FramePool, PooledFrame};

/// Most buffers a ring may request.
pub const MAX_BUFFER_COUNT: u32 = 32;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config source error: {0}")]
    Source(#[from] config::ConfigError),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub pool: PoolConfig,
    pub encoder: EncoderSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Capture node; empty means auto-detect.
    pub device: String,
    pub buffer_count: u32,
    pub poll_timeout_ms: u64,
    pub idle_sleep_ms: u64,
    pub stall_timeout_ms: u64,
    /// Shutdown re-checks outstanding buffers at least this often.
    pub drain_poll_ms: u64,
    /// Give up draining after this long. Unset waits forever.
    pub drain_timeout_ms: Option<u64>,
    /// Format to negotiate before requesting buffers.
    pub format: Option<FormatRequest>,
    /// Pin the capture thread to this core.
    pub cpu_affinity: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatRequest {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
}

/// Frames requested from the pool by the convert stage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".into(),
            buffer_count: 4,
            poll_timeout_ms: 100,
            idle_sleep_ms: 10,
            stall_timeout_ms: 2000,
            drain_poll_ms: 250,
            drain_timeout_ms: None,
            format: None,
            cpu_affinity: None,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            format: PixelFormat::Yuv420Planar,
        }
    }
}

impl CaptureConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    pub fn drain_poll(&self) -> Duration {
        Duration::from_millis(self.drain_poll_ms)
    }

    pub fn drain_timeout(&self) -> Option<Duration> {
        self.drain_timeout_ms.map(Duration::from_millis)
    }
}

impl Config {
    /// Load from an optional TOML file, then `KVMCAP_*` environment overrides
    /// (`KVMCAP_CAPTURE__BUFFER_COUNT=6`).
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("KVMCAP")
                .prefix_separator("_")
                .separator("__"),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let capture = &self.capture;
        if capture.buffer_count == 0 || capture.buffer_count > MAX_BUFFER_COUNT {
            return Err(ConfigError::Invalid(format!(
                "capture.buffer_count must be in 1..={MAX_BUFFER_COUNT}, got {}",
                capture.buffer_count
            )));
        }
        if capture.poll_timeout_ms == 0
            || capture.stall_timeout_ms == 0
            || capture.drain_poll_ms == 0
        {
            return Err(ConfigError::Invalid("capture timings must be non-zero".into()));
        }
        if self.pool.width == 0 || self.pool.height == 0 {
            return Err(ConfigError::Invalid("pool dimensions must be non-zero".into()));
        }
        if self.encoder.framerate == 0 {
            return Err(ConfigError::Invalid("encoder.framerate must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.capture.buffer_count, 4);
        assert_eq!(config.capture.poll_timeout(), Duration::from_millis(100));
        assert_eq!(config.capture.stall_timeout(), Duration::from_millis(2000));
        assert_eq!(config.capture.drain_timeout(), None);
        assert_eq!(config.encoder.bitrate_kbps, 4000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
[capture]
device = "/dev/video2"
buffer_count = 6
drain_timeout_ms = 5000
cpu_affinity = 3

[capture.format]
width = 1280
height = 720
pixel_format = "Yuyv"

[pool]
width = 1280
height = 720
format = "Yuv422Planar"

[encoder]
bitrate_kbps = 8000
framerate = 60
gop_interval_frames = 120
        "#;

        let config = Config::from_toml_str(toml).unwrap();

        assert_eq!(config.capture.device, "/dev/video2");
        assert_eq!(config.capture.buffer_count, 6);
        assert_eq!(config.capture.poll_timeout_ms, 100);
        assert_eq!(config.capture.drain_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.capture.cpu_affinity, Some(3));
        assert_eq!(
            config.capture.format,
            Some(FormatRequest {
                width: 1280,
                height: 720,
                pixel_format: PixelFormat::Yuyv,
            })
        );
        assert_eq!(config.pool.format, PixelFormat::Yuv422Planar);
        assert_eq!(config.encoder.framerate, 60);
    }

    #[test]
    fn test_invalid_buffer_count() {
        let toml = r#"
[capture]
buffer_count = 0
        "#;
        assert!(Config::from_toml_str(toml).is_err());

        let toml = r#"
[capture]
buffer_count = 64
        "#;
        assert!(Config::from_toml_str(toml).is_err());
    }

    #[test]
    fn test_invalid_pool_dimensions() {
        let toml = r#"
[pool]
width = 0
        "#;
        assert!(Config::from_toml_str(toml).is_err());
    }
}
