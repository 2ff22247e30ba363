//! Hardware encoder seam.
//!
//! The encoder itself is vendor code; this module fixes its settings and call
//! contract. `encode` borrows the encoder mutably and returns a slice tied to
//! that borrow, so output must be consumed or copied before the next call.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::PooledFrame;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EncodeError {
    #[error("encoder not initialized")]
    NotInitialized,

    #[error("encoder failure: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderSettings {
    pub bitrate_kbps: u32,
    pub framerate: u32,
    /// Interval between keyframes.
    pub gop_interval_frames: u32,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            bitrate_kbps: 4000, // 4 Mbps
            framerate: 30,
            gop_interval_frames: 30,
        }
    }
}

/// A hardware encoder consuming pooled frames.
pub trait FrameEncoder {
    fn set_settings(&mut self, settings: EncoderSettings);

    /// Encode one frame. The returned bitstream lives in the encoder's own
    /// buffer and is overwritten by the next call.
    fn encode(&mut self, frame: &PooledFrame, force_keyframe: bool) -> Result<&[u8], EncodeError>;

    fn shutdown(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FramePool, PixelFormat};

    /// Writes a tiny header plus the luma checksum into a reused buffer.
    #[derive(Default)]
    struct ChecksumEncoder {
        settings: EncoderSettings,
        frames: u32,
        out: Vec<u8>,
    }

    impl FrameEncoder for ChecksumEncoder {
        fn set_settings(&mut self, settings: EncoderSettings) {
            self.settings = settings;
        }

        fn encode(
            &mut self,
            frame: &PooledFrame,
            force_keyframe: bool,
        ) -> Result<&[u8], EncodeError> {
            if self.settings.gop_interval_frames == 0 {
                return Err(EncodeError::NotInitialized);
            }
            let keyframe = force_keyframe || self.frames % self.settings.gop_interval_frames == 0;
            self.frames += 1;

            let sum: u32 = frame.plane(0).unwrap_or(&[]).iter().map(|&b| u32::from(b)).sum();
            self.out.clear();
            self.out.push(u8::from(keyframe));
            self.out.extend_from_slice(&sum.to_le_bytes());
            Ok(&self.out)
        }

        fn shutdown(&mut self) {
            self.out = Vec::new();
        }
    }

    #[test]
    fn test_default_settings() {
        let settings = EncoderSettings::default();
        assert_eq!(settings.bitrate_kbps, 4000);
        assert_eq!(settings.framerate, 30);
        assert_eq!(settings.gop_interval_frames, 30);
    }

    #[test]
    fn test_keyframe_cadence() {
        let pool = FramePool::new();
        let frame = pool.allocate(64, 16, PixelFormat::Yuv420Planar).unwrap();

        let mut encoder = ChecksumEncoder::default();
        encoder.set_settings(EncoderSettings {
            gop_interval_frames: 2,
            ..Default::default()
        });

        let keyframes: Vec<u8> = (0..4)
            .map(|_| encoder.encode(&frame, false).unwrap()[0])
            .collect();
        assert_eq!(keyframes, vec![1, 0, 1, 0]);
        assert_eq!(encoder.encode(&frame, true).unwrap()[0], 1);

        encoder.shutdown();
    }

    #[test]
    fn test_unconfigured_encoder_rejects_frames() {
        let pool = FramePool::new();
        let frame = pool.allocate(64, 16, PixelFormat::Rgb24).unwrap();

        let mut encoder = ChecksumEncoder {
            settings: EncoderSettings {
                gop_interval_frames: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(encoder.encode(&frame, false), Err(EncodeError::NotInitialized));
    }
}
