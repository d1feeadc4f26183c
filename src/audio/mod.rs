//! # Audio Module
//!
//! Turns uploaded audio into the one format every model consumes.
//!
//! ## Audio Format Requirements:
//! - **Sample Rate**: 16kHz (16,000 Hz)
//! - **Channels**: Mono (1 channel)
//! - **Samples**: `f32` in `[-1.0, 1.0]`
//!
//! Uploads may be RIFF/WAVE in any common layout or raw 16-bit little-endian
//! PCM already at 16 kHz mono.

pub mod processor; // Container decoding, downmix and resampling

pub use processor::{AudioDecodeError, AudioNormalizer};

use crate::runtime::SpeechSegment;
use std::sync::Arc;

/// Sample rate of every [`AudioClip`].
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Normalized 16 kHz mono audio. Cheap to clone.
#[derive(Debug, Clone)]
pub struct AudioClip {
    samples: Arc<[f32]>,
}

impl AudioClip {
    pub fn new(samples: Vec<f32>) -> Self {
        Self { samples: samples.into() }
    }

    #[cfg(test)]
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn shared(&self) -> Arc<[f32]> {
        Arc::clone(&self.samples)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_s(&self) -> f64 {
        self.samples.len() as f64 / TARGET_SAMPLE_RATE as f64
    }

    /// Samples inside `segment`, clamped to the clip.
    pub fn slice(&self, segment: &SpeechSegment) -> &[f32] {
        let to_index = |seconds: f64| {
            ((seconds.max(0.0) * TARGET_SAMPLE_RATE as f64) as usize).min(self.samples.len())
        };
        let start = to_index(segment.start_s);
        let end = to_index(segment.end_s).max(start);
        &self.samples[start..end]
    }
}
