//! Slaney-scale mel filterbank for Whisper's log-mel front end.

fn hertz_to_mel(freq: f32) -> f32 {
    let min_log_hertz = 1000.0;
    let min_log_mel = 15.0;
    let logstep = 27.0 / 6.4f32.ln();
    if freq < min_log_hertz {
        3.0 * freq / 200.0
    } else {
        min_log_mel + (freq / min_log_hertz).ln() * logstep
    }
}

fn mel_to_hertz(mel: f32) -> f32 {
    let min_log_hertz = 1000.0;
    let min_log_mel = 15.0;
    let logstep = 6.4f32.ln() / 27.0;
    if mel < min_log_mel {
        200.0 * mel / 3.0
    } else {
        min_log_hertz * ((mel - min_log_mel) * logstep).exp()
    }
}

/// Row-major `[n_mels, n_fft / 2 + 1]` filterbank covering 0 Hz to Nyquist.
pub fn filterbank(n_mels: usize, n_fft: usize, sample_rate: u32) -> Vec<f32> {
    let n_freqs = n_fft / 2 + 1;
    let nyquist = sample_rate as f32 / 2.0;

    let fft_freqs: Vec<f32> = (0..n_freqs)
        .map(|i| nyquist * i as f32 / (n_freqs - 1).max(1) as f32)
        .collect();

    let mel_max = hertz_to_mel(nyquist);
    let edges: Vec<f32> = (0..n_mels + 2)
        .map(|i| mel_to_hertz(mel_max * i as f32 / (n_mels + 1) as f32))
        .collect();

    let mut filters = vec![0.0f32; n_mels * n_freqs];
    for mel in 0..n_mels {
        let (lower, center, upper) = (edges[mel], edges[mel + 1], edges[mel + 2]);
        let norm = if upper > lower { 2.0 / (upper - lower) } else { 0.0 };

        for (bin, &freq) in fft_freqs.iter().enumerate() {
            let rising = if center > lower { (freq - lower) / (center - lower) } else { 0.0 };
            let falling = if upper > center { (upper - freq) / (upper - center) } else { 0.0 };
            filters[mel * n_freqs + bin] = rising.min(falling).max(0.0) * norm;
        }
    }
    filters
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filterbank_shape() {
        let filters = filterbank(80, 400, 16_000);
        assert_eq!(filters.len(), 80 * 201);
        assert!(filters.iter().all(|w| w.is_finite() && *w >= 0.0));
    }

    #[test]
    fn test_every_band_has_weight() {
        let filters = filterbank(80, 400, 16_000);
        for band in filters.chunks(201) {
            assert!(band.iter().any(|w| *w > 0.0));
        }
    }

    #[test]
    fn test_mel_scale_round_trip() {
        for hz in [0.0f32, 440.0, 1000.0, 4000.0, 8000.0] {
            assert!((mel_to_hertz(hertz_to_mel(hz)) - hz).abs() < 0.5);
        }
    }
}
