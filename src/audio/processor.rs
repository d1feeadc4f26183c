//! # Audio Normalization
//!
//! Decodes uploaded bytes into a 16 kHz mono [`AudioClip`].
//!
//! ## Accepted Inputs:
//! - **RIFF/WAVE**: 8/16/24-bit integer or 32-bit float, any channel count
//!   and sample rate (downmixed and resampled)
//! - **Raw PCM**: headerless 16-bit little-endian mono at 16 kHz
//!
//! ## Conversion:
//! Integer samples are scaled to `[-1.0, 1.0]`, channels are averaged, and
//! other sample rates are linearly interpolated to 16 kHz.

use crate::audio::{AudioClip, TARGET_SAMPLE_RATE};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum AudioDecodeError {
    #[error("Audio payload is empty")]
    Empty,

    #[error("Audio payload of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },

    #[error("Invalid WAV data: {0}")]
    InvalidWav(String),

    #[error("Unsupported audio format: {0}")]
    Unsupported(String),

    #[error("Raw PCM length must be even for 16-bit samples, got {0} bytes")]
    OddPcmLength(usize),
}

/// Decodes uploads and enforces the upload size cap.
#[derive(Debug, Clone)]
pub struct AudioNormalizer {
    max_upload_bytes: usize,
}

impl AudioNormalizer {
    pub fn new(max_upload_bytes: usize) -> Self {
        Self { max_upload_bytes }
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_bytes
    }

    /// Decode `data` into 16 kHz mono samples.
    ///
    /// ## Returns:
    /// - **Ok(AudioClip)**: normalized audio
    /// - **Err(AudioDecodeError)**: empty, oversized or undecodable input
    pub fn normalize(&self, data: &[u8]) -> Result<AudioClip, AudioDecodeError> {
        if data.is_empty() {
            return Err(AudioDecodeError::Empty);
        }
        if data.len() > self.max_upload_bytes {
            return Err(AudioDecodeError::TooLarge {
                size: data.len(),
                limit: self.max_upload_bytes,
            });
        }

        let samples = if is_riff_wave(data) {
            decode_wav(data)?
        } else {
            debug!(bytes = data.len(), "No RIFF header, treating upload as raw s16le PCM");
            pcm_to_float(data)?
        };

        Ok(AudioClip::new(samples))
    }
}

fn is_riff_wave(data: &[u8]) -> bool {
    data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WAVE"
}

fn decode_wav(data: &[u8]) -> Result<Vec<f32>, AudioDecodeError> {
    let mut cursor = Cursor::new(data);
    let (header, body) =
        wav::read(&mut cursor).map_err(|e| AudioDecodeError::InvalidWav(e.to_string()))?;

    let interleaved: Vec<f32> = match body {
        wav::BitDepth::Eight(samples) => {
            samples.iter().map(|&s| (s as f32 - 128.0) / 128.0).collect()
        }
        wav::BitDepth::Sixteen(samples) => samples.iter().map(|&s| s as f32 / 32768.0).collect(),
        wav::BitDepth::TwentyFour(samples) => {
            samples.iter().map(|&s| s as f32 / 8_388_608.0).collect()
        }
        wav::BitDepth::ThirtyTwoFloat(samples) => samples,
        wav::BitDepth::Empty => {
            return Err(AudioDecodeError::Unsupported("WAV file has no sample data".into()))
        }
    };

    let channels = header.channel_count.max(1) as usize;
    let mono = downmix(&interleaved, channels);
    debug!(
        channels,
        sample_rate = header.sampling_rate,
        frames = mono.len(),
        "Decoded WAV upload"
    );

    if header.sampling_rate == 0 {
        return Err(AudioDecodeError::InvalidWav("sample rate is zero".into()));
    }
    Ok(resample_linear(&mono, header.sampling_rate, TARGET_SAMPLE_RATE))
}

/// Convert raw little-endian 16-bit PCM to `f32` samples.
pub fn pcm_to_float(data: &[u8]) -> Result<Vec<f32>, AudioDecodeError> {
    if data.len() % 2 != 0 {
        return Err(AudioDecodeError::OddPcmLength(data.len()));
    }
    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample as f32 / 32768.0);
    }
    Ok(samples)
}

/// Average interleaved channels into one.
pub fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Linear-interpolation resampler.
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((samples.len() as f64) / ratio).floor() as usize;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let position = i as f64 * ratio;
            let index = (position.floor() as usize).min(last);
            let next = (index + 1).min(last);
            let fraction = (position - index as f64) as f32;
            samples[index] * (1.0 - fraction) + samples[next] * fraction
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wav_bytes(channels: u16, sample_rate: u32, samples: &[i16]) -> Vec<u8> {
        let header = wav::Header::new(wav::header::WAV_FORMAT_PCM, channels, sample_rate, 16);
        let mut out = Cursor::new(Vec::new());
        wav::write(header, &wav::BitDepth::Sixteen(samples.to_vec()), &mut out).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_raw_pcm_conversion() {
        let mut data = Vec::new();
        for sample in [0i16, 16384, -16384, 32767, -32768] {
            data.extend_from_slice(&sample.to_le_bytes());
        }
        let clip = AudioNormalizer::new(1024).normalize(&data).unwrap();

        let samples = clip.samples();
        assert_eq!(samples.len(), 5);
        assert_eq!(samples[0], 0.0);
        assert!((samples[1] - 0.5).abs() < 1e-6);
        assert_eq!(samples[4], -1.0);
    }

    #[test]
    fn test_odd_raw_length_rejected() {
        let result = AudioNormalizer::new(1024).normalize(&[0u8; 15]);
        assert!(matches!(result, Err(AudioDecodeError::OddPcmLength(15))));
    }

    #[test]
    fn test_empty_and_oversized_rejected() {
        let normalizer = AudioNormalizer::new(8);
        assert!(matches!(normalizer.normalize(&[]), Err(AudioDecodeError::Empty)));
        assert!(matches!(normalizer.normalize(&[0u8; 10]), Err(AudioDecodeError::TooLarge { .. })));
    }

    #[test]
    fn test_stereo_wav_is_downmixed() {
        // Left at +0.5, right at -0.5: the average is silence.
        let frames: Vec<i16> = (0..1600).flat_map(|_| [16384i16, -16384]).collect();
        let clip = AudioNormalizer::new(1 << 20).normalize(&wav_bytes(2, 16_000, &frames)).unwrap();

        assert_eq!(clip.samples().len(), 1600);
        assert!(clip.samples().iter().all(|s| s.abs() < 1e-6));
    }

    #[test]
    fn test_wav_at_other_rate_is_resampled() {
        let samples = vec![8192i16; 48_000];
        let wav = wav_bytes(1, 48_000, &samples);
        let clip = AudioNormalizer::new(1 << 20).normalize(&wav).unwrap();

        assert_eq!(clip.samples().len(), 16_000);
        assert!((clip.duration_s() - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_truncated_wav_rejected() {
        let mut data = wav_bytes(1, 16_000, &[1, 2, 3, 4]);
        data.truncate(20);
        assert!(AudioNormalizer::new(1024).normalize(&data).is_err());
    }

    #[test]
    fn test_resample_halves_length() {
        let out = resample_linear(&[0.0, 1.0, 0.0, 1.0], 32_000, 16_000);
        assert_eq!(out, vec![0.0, 0.0]);
    }
}
