//! # Energy Voice Activity Detector
//!
//! Frame-level RMS gate with hysteresis, padding and a maximum segment length.
//!
//! ## Steps:
//! 1. Split the clip into fixed frames and mark frames above the RMS threshold
//! 2. Open a segment after `min_speech_ms` of voiced frames, close it after
//!    `min_silence_ms` of unvoiced frames
//! 3. Pad each segment, merge overlaps, and cut segments longer than
//!    `max_segment_ms` into pieces

use crate::audio::TARGET_SAMPLE_RATE;
use crate::runtime::backend::{SpeechSegment, VoiceActivityDetector};
use crate::runtime::{ModelError, Precision};
use serde::{Deserialize, Serialize};

/// VAD settings, the `models.vad` configuration section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnergyVadConfig {
    pub frame_ms: usize,
    /// Frame RMS (on `[-1, 1]` samples) at or above which a frame counts as voiced
    pub energy_threshold: f32,
    pub min_speech_ms: usize,
    pub min_silence_ms: usize,
    pub pad_ms: usize,
    pub max_segment_ms: usize,
}

impl Default for EnergyVadConfig {
    fn default() -> Self {
        Self {
            frame_ms: 30,
            energy_threshold: 0.01,
            min_speech_ms: 300,
            min_silence_ms: 200,
            pad_ms: 150,
            max_segment_ms: 30_000,
        }
    }
}

pub struct EnergyVad {
    config: EnergyVadConfig,
}

impl EnergyVad {
    pub fn new(config: EnergyVadConfig) -> Self {
        Self { config }
    }

    /// Speech spans as sample index ranges.
    pub fn segment(&self, samples: &[f32]) -> Vec<(usize, usize)> {
        let cfg = &self.config;
        let rate = TARGET_SAMPLE_RATE as usize;
        let frame_len = rate * cfg.frame_ms / 1000;
        if frame_len == 0 {
            return Vec::new();
        }
        let n_frames = samples.len() / frame_len;
        if n_frames == 0 {
            return Vec::new();
        }

        let min_speech_frames = cfg.min_speech_ms.div_ceil(cfg.frame_ms).max(1);
        let min_silence_frames = cfg.min_silence_ms.div_ceil(cfg.frame_ms).max(1);
        let pad_frames = cfg.pad_ms.div_ceil(cfg.frame_ms);

        let voiced: Vec<bool> = samples
            .chunks_exact(frame_len)
            .map(|frame| rms(frame) >= cfg.energy_threshold)
            .collect();

        let mut raw: Vec<(usize, usize)> = Vec::new();
        let mut in_speech = false;
        let mut start_frame = 0;
        let mut speech_run = 0;
        let mut silence_run = 0;

        for (i, &is_voiced) in voiced.iter().enumerate() {
            if is_voiced {
                silence_run = 0;
                if !in_speech {
                    speech_run += 1;
                    if speech_run >= min_speech_frames {
                        in_speech = true;
                        start_frame = i + 1 - speech_run;
                    }
                }
            } else {
                speech_run = 0;
                if in_speech {
                    silence_run += 1;
                    if silence_run >= min_silence_frames {
                        raw.push((start_frame, i + 1 - silence_run));
                        in_speech = false;
                        silence_run = 0;
                    }
                }
            }
        }
        if in_speech {
            raw.push((start_frame, voiced.len()));
        }

        let mut merged: Vec<(usize, usize)> = Vec::new();
        for (first, last) in raw {
            let start = first.saturating_sub(pad_frames) * frame_len;
            let end = ((last + pad_frames).min(voiced.len()) * frame_len).min(samples.len());
            if end <= start {
                continue;
            }
            match merged.last_mut() {
                Some(previous) if start <= previous.1 => previous.1 = previous.1.max(end),
                _ => merged.push((start, end)),
            }
        }

        let max_len = cfg.max_segment_ms * rate / 1000;
        if max_len == 0 {
            return merged;
        }
        merged
            .into_iter()
            .flat_map(|(start, end)| {
                (start..end)
                    .step_by(max_len)
                    .map(move |piece| (piece, (piece + max_len).min(end)))
            })
            .collect()
    }
}

fn rms(frame: &[f32]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    (frame.iter().map(|s| s * s).sum::<f32>() / frame.len() as f32).sqrt()
}

impl VoiceActivityDetector for EnergyVad {
    fn detect(
        &self,
        samples: &[f32],
        _precision: Precision,
    ) -> Result<Vec<SpeechSegment>, ModelError> {
        let rate = TARGET_SAMPLE_RATE as f64;
        Ok(self
            .segment(samples)
            .into_iter()
            .map(|(start, end)| SpeechSegment {
                start_s: start as f64 / rate,
                end_s: end as f64 / rate,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(seconds: f32) -> Vec<f32> {
        let n = (seconds * 16_000.0) as usize;
        (0..n).map(|i| 0.2 * (i as f32 * 0.1).sin()).collect()
    }

    fn silence(seconds: f32) -> Vec<f32> {
        vec![0.0; (seconds * 16_000.0) as usize]
    }

    #[test]
    fn test_silence_has_no_speech() {
        let vad = EnergyVad::new(EnergyVadConfig::default());
        assert!(vad.detect(&silence(2.0), Precision::Full).unwrap().is_empty());
    }

    #[test]
    fn test_tone_between_silence_is_one_padded_segment() {
        let vad = EnergyVad::new(EnergyVadConfig::default());
        let mut samples = silence(1.0);
        samples.extend(tone(1.0));
        samples.extend(silence(1.0));

        let segments = vad.detect(&samples, Precision::Full).unwrap();
        assert_eq!(segments.len(), 1);
        assert!(segments[0].start_s < 1.0 && segments[0].start_s > 0.7);
        assert!(segments[0].end_s > 2.0 && segments[0].end_s < 2.3);
    }

    #[test]
    fn test_short_gap_is_bridged() {
        let vad = EnergyVad::new(EnergyVadConfig::default());
        let mut samples = tone(0.6);
        samples.extend(silence(0.1));
        samples.extend(tone(0.6));

        assert_eq!(vad.segment(&samples).len(), 1);
    }

    #[test]
    fn test_long_segments_are_split() {
        let vad = EnergyVad::new(EnergyVadConfig { max_segment_ms: 1_000, ..Default::default() });
        let segments = vad.segment(&tone(2.5));

        assert_eq!(segments.len(), 3);
        assert!(segments.iter().all(|(s, e)| e - s <= 16_000));
    }

    #[test]
    fn test_short_blip_ignored() {
        let vad = EnergyVad::new(EnergyVadConfig::default());
        let mut samples = silence(0.5);
        samples.extend(tone(0.1));
        samples.extend(silence(0.5));
        assert!(vad.segment(&samples).is_empty());
    }
}
