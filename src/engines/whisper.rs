//! # Whisper Engine
//!
//! Candle implementation of Whisper serving both the ASR and the LID slots.
//!
//! ## Inference:
//! - **Front end**: 16 kHz PCM → log-mel spectrogram, processed in 30 s windows
//! - **LID**: one decoder step after `<|startoftranscript|>`, softmax over the
//!   language tokens
//! - **ASR**: greedy decoding with timestamp tokens; each timestamped span is
//!   split into words whose timings are interpolated across the span
//!
//! ## Precision:
//! Weights live at F16 or F32. An inference requested at a different
//! precision than the resident weights rebuilds the model from the mmaped
//! safetensors first. Half precision is only honoured on an accelerator.
//! Non-finite logits surface as [`ModelError::NumericFailure`].

use crate::engines::mel;
use crate::pipeline::script::is_unspaced;
use crate::runtime::backend::{
    LanguageGuess, LanguageIdentifier, Token, Transcriber, Transcript, WeightFiles,
};
use crate::runtime::{ModelError, ModelKind, Precision};
use candle_core::{DType, Device, IndexOp, Tensor, D};
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self as m, Config};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokenizers::Tokenizer;
use tracing::{debug, info};

/// Seconds per timestamp token step.
const TIMESTAMP_STEP_S: f64 = 0.02;

/// Language codes Whisper has tokens for.
const LANGUAGES: [&str; 99] = [
    "en", "zh", "de", "es", "ru", "ko", "fr", "ja", "pt", "tr", "pl", "ca", "nl", "ar", "sv", "it",
    "id", "hi", "fi", "vi", "he", "uk", "el", "ms", "cs", "ro", "da", "hu", "ta", "no", "th", "ur",
    "hr", "bg", "lt", "la", "mi", "ml", "cy", "sk", "te", "fa", "lv", "bn", "sr", "az", "sl", "kn",
    "et", "mk", "br", "eu", "is", "hy", "ne", "mn", "bs", "kk", "sq", "sw", "gl", "mr", "pa", "si",
    "km", "sn", "yo", "so", "af", "oc", "ka", "be", "tg", "sd", "gu", "am", "yi", "lo", "uz", "fo",
    "ht", "ps", "tk", "nn", "mt", "sa", "lb", "my", "bo", "tl", "mg", "as", "tt", "haw", "ln",
    "ha", "ba", "jw", "su",
];

/// Ids of the special tokens the decoder needs.
#[derive(Debug, Clone)]
struct SpecialTokens {
    sot: u32,
    eot: u32,
    transcribe: u32,
    no_timestamps: u32,
    /// `(code, token id)` for every language the tokenizer knows; empty for English-only models
    languages: Vec<(&'static str, u32)>,
}

impl SpecialTokens {
    fn resolve(kind: ModelKind, tokenizer: &Tokenizer) -> Result<Self, ModelError> {
        let id = |token: &str| {
            tokenizer
                .token_to_id(token)
                .ok_or_else(|| ModelError::load(kind, format!("tokenizer has no {} token", token)))
        };
        let languages = LANGUAGES
            .iter()
            .filter_map(|&code| {
                tokenizer.token_to_id(&format!("<|{}|>", code)).map(|id| (code, id))
            })
            .collect();

        Ok(Self {
            sot: id(m::SOT_TOKEN)?,
            eot: id(m::EOT_TOKEN)?,
            transcribe: id(m::TRANSCRIBE_TOKEN)?,
            no_timestamps: id(m::NO_TIMESTAMPS_TOKEN)?,
            languages,
        })
    }

    fn timestamp_begin(&self) -> u32 {
        self.no_timestamps + 1
    }
}

struct ResidentModel {
    model: m::model::Whisper,
    dtype: DType,
}

pub struct WhisperEngine {
    kind: ModelKind,
    device: Device,
    config: Config,
    weights_path: PathBuf,
    tokenizer: Tokenizer,
    special: SpecialTokens,
    mel_filters: Vec<f32>,
    max_decode_tokens: usize,
    resident: Mutex<ResidentModel>,
}

impl WhisperEngine {
    /// Load config, tokenizer and weights for `kind` at `precision`.
    pub fn load(
        kind: ModelKind,
        weights: &WeightFiles,
        device: Device,
        precision: Precision,
        max_decode_tokens: usize,
    ) -> Result<Self, ModelError> {
        let load_err = |e: &dyn std::fmt::Display| ModelError::load(kind, e.to_string());

        let config_file =
            std::fs::File::open(weights.get(kind, "config.json")?).map_err(|e| load_err(&e))?;
        let config: Config = serde_json::from_reader(config_file).map_err(|e| load_err(&e))?;
        let tokenizer =
            Tokenizer::from_file(weights.get(kind, "tokenizer.json")?).map_err(|e| load_err(&e))?;
        let special = SpecialTokens::resolve(kind, &tokenizer)?;
        let weights_path = weights.get(kind, "model.safetensors")?.to_path_buf();

        let dtype = dtype_for(&device, precision);
        let model = build_model(&config, &weights_path, dtype, &device).map_err(|e| load_err(&e))?;
        let mel_filters = mel::filterbank(config.num_mel_bins, m::N_FFT, m::SAMPLE_RATE as u32);

        info!(
            kind = %kind,
            dtype = ?dtype,
            mel_bins = config.num_mel_bins,
            languages = special.languages.len(),
            "Whisper weights resident"
        );

        Ok(Self {
            kind,
            device,
            config,
            weights_path,
            tokenizer,
            special,
            mel_filters,
            max_decode_tokens,
            resident: Mutex::new(ResidentModel { model, dtype }),
        })
    }

    /// Run `f` against the resident model at `precision`, rebuilding weights if needed.
    fn with_model<T>(
        &self,
        precision: Precision,
        f: impl FnOnce(&mut m::model::Whisper, DType) -> candle_core::Result<T>,
    ) -> Result<T, ModelError> {
        let mut resident = self.resident.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let dtype = dtype_for(&self.device, precision);

        if resident.dtype != dtype {
            info!(
                kind = %self.kind,
                from = ?resident.dtype,
                to = ?dtype,
                "Rebuilding Whisper weights"
            );
            resident.model = build_model(&self.config, &self.weights_path, dtype, &self.device)
                .map_err(|e| ModelError::load(self.kind, e.to_string()))?;
            resident.dtype = dtype;
        }

        f(&mut resident.model, dtype).map_err(|e| classify(e, precision))
    }

    /// Log-mel windows of at most 30 s, as `(tensor, offset_s, length_s)`.
    fn mel_windows(
        &self,
        samples: &[f32],
        dtype: DType,
    ) -> candle_core::Result<Vec<(Tensor, f64, f64)>> {
        let n_mels = self.config.num_mel_bins;
        let mel = m::audio::pcm_to_mel(&self.config, samples, &self.mel_filters);
        let total_frames = mel.len() / n_mels;
        let mel = Tensor::from_vec(mel, (1, n_mels, total_frames), &self.device)?.to_dtype(dtype)?;

        let content_frames = (samples.len() / m::HOP_LENGTH).max(1).min(total_frames);
        let frame_s = m::HOP_LENGTH as f64 / m::SAMPLE_RATE as f64;

        let mut windows = Vec::new();
        let mut seek = 0;
        while seek < content_frames {
            let size = m::N_FRAMES.min(total_frames - seek);
            let content = m::N_FRAMES.min(content_frames - seek);
            let window = mel.narrow(2, seek, size)?;
            windows.push((window, seek as f64 * frame_s, content as f64 * frame_s));
            seek += m::N_FRAMES;
        }
        Ok(windows)
    }

    /// Language probabilities for one mel window, highest first.
    fn language_probs(
        &self,
        model: &mut m::model::Whisper,
        mel: &Tensor,
    ) -> candle_core::Result<Vec<(&'static str, f32)>> {
        if self.special.languages.is_empty() {
            return Ok(vec![("en", 1.0)]);
        }

        let features = model.encoder.forward(mel, true)?;
        let tokens = Tensor::new(&[[self.special.sot]], &self.device)?;
        let ys = model.decoder.forward(&tokens, &features, true)?;
        let logits = model.decoder.final_linear(&ys.i(..1)?)?.i(0)?.i(0)?;

        let ids: Vec<u32> = self.special.languages.iter().map(|(_, id)| *id).collect();
        let ids = Tensor::new(ids.as_slice(), &self.device)?;
        let logits = logits.index_select(&ids, 0)?.to_dtype(DType::F32)?;
        let probs = candle_nn::ops::softmax(&logits, D::Minus1)?.to_vec1::<f32>()?;
        ensure_finite(&probs)?;

        let mut ranked: Vec<(&'static str, f32)> = self
            .special
            .languages
            .iter()
            .map(|(code, _)| *code)
            .zip(probs)
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        Ok(ranked)
    }

    /// Greedy-decode one window into timed tokens.
    fn decode_window(
        &self,
        model: &mut m::model::Whisper,
        mel: &Tensor,
        language: Option<u32>,
        window_s: f64,
    ) -> candle_core::Result<DecodedWindow> {
        let features = model.encoder.forward(mel, true)?;

        let mut tokens = vec![self.special.sot];
        tokens.extend(language);
        tokens.push(self.special.transcribe);
        let prefix = tokens.len();

        let limit = self.max_decode_tokens.min(self.config.max_target_positions / 2);
        let mut logprob_sum = 0.0f64;

        for step in 0..limit {
            let input = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
            let ys = model.decoder.forward(&input, &features, step == 0)?;
            let (_, seq_len, _) = ys.dims3()?;
            let logits = model
                .decoder
                .final_linear(&ys.i((..1, seq_len - 1..))?)?
                .i(0)?
                .i(0)?
                .to_dtype(DType::F32)?
                .to_vec1::<f32>()?;
            ensure_finite(&logits)?;

            let (next, best) = logits
                .iter()
                .copied()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(&b.1))
                .map(|(i, v)| (i as u32, v))
                .unwrap_or((self.special.eot, 0.0));
            if next == self.special.eot {
                break;
            }

            let max = best as f64;
            let log_norm = logits.iter().map(|&v| (v as f64 - max).exp()).sum::<f64>().ln() + max;
            logprob_sum += best as f64 - log_norm;
            tokens.push(next);
        }

        let generated = &tokens[prefix..];
        let spans = self.timestamp_spans(generated, window_s);
        let mut timed = Vec::new();
        for (start_s, end_s, ids) in spans {
            let text = self
                .tokenizer
                .decode(&ids, true)
                .map_err(|e| candle_core::Error::Msg(format!("tokenizer decode failed: {}", e)))?;
            timed.extend(spread_words(text.trim(), start_s, end_s));
        }

        Ok(DecodedWindow { tokens: timed, generated: generated.len(), logprob_sum })
    }

    /// Group generated ids into `(start_s, end_s, text ids)` spans.
    fn timestamp_spans(&self, generated: &[u32], window_s: f64) -> Vec<(f64, f64, Vec<u32>)> {
        let ts_begin = self.special.timestamp_begin();
        let mut spans = Vec::new();
        let mut start = 0.0;
        let mut text_ids: Vec<u32> = Vec::new();

        for &id in generated {
            if id >= ts_begin {
                let at = ((id - ts_begin) as f64 * TIMESTAMP_STEP_S).min(window_s);
                if !text_ids.is_empty() {
                    spans.push((start, at.max(start), std::mem::take(&mut text_ids)));
                }
                start = at;
            } else if id < self.special.eot {
                text_ids.push(id);
            }
        }
        if !text_ids.is_empty() {
            spans.push((start, window_s.max(start), text_ids));
        }
        spans
    }

    fn check_input(&self, samples: &[f32]) -> Result<(), ModelError> {
        if samples.is_empty() {
            return Err(ModelError::inference("audio is empty"));
        }
        Ok(())
    }
}

struct DecodedWindow {
    tokens: Vec<Token>,
    generated: usize,
    logprob_sum: f64,
}

impl LanguageIdentifier for WhisperEngine {
    fn identify(&self, samples: &[f32], precision: Precision) -> Result<LanguageGuess, ModelError> {
        self.check_input(samples)?;
        self.with_model(precision, |model, dtype| {
            let windows = self.mel_windows(samples, dtype)?;
            let Some((mel, _, _)) = windows.first() else {
                return Ok(LanguageGuess { lang: "en".to_string(), confidence: 0.0 });
            };
            let ranked = self.language_probs(model, mel)?;
            let (lang, confidence) = ranked.first().copied().unwrap_or(("en", 0.0));
            debug!(lang, confidence, "Language identified");
            Ok(LanguageGuess { lang: lang.to_string(), confidence })
        })
    }
}

impl Transcriber for WhisperEngine {
    fn transcribe(&self, samples: &[f32], precision: Precision) -> Result<Transcript, ModelError> {
        self.check_input(samples)?;
        self.with_model(precision, |model, dtype| {
            let windows = self.mel_windows(samples, dtype)?;

            let language = match windows.first() {
                Some((mel, _, _)) if !self.special.languages.is_empty() => {
                    let ranked = self.language_probs(model, mel)?;
                    ranked
                        .first()
                        .and_then(|(code, _)| {
                            self.special.languages.iter().find(|(c, _)| c == code)
                        })
                        .map(|(_, id)| *id)
                }
                _ => None,
            };

            let mut tokens = Vec::new();
            let mut generated = 0;
            let mut logprob_sum = 0.0;
            for (mel, offset_s, window_s) in &windows {
                let window = self.decode_window(model, mel, language, *window_s)?;
                tokens.extend(window.tokens.into_iter().map(|t| t.shifted(*offset_s)));
                generated += window.generated;
                logprob_sum += window.logprob_sum;
            }

            let confidence = (generated > 0)
                .then(|| (logprob_sum / generated as f64).exp().clamp(0.0, 1.0) as f32);
            let text = crate::pipeline::filters::render_tokens(&tokens);
            debug!(
                windows = windows.len(),
                generated,
                chars = text.len(),
                "Whisper transcription finished"
            );
            Ok(Transcript { text, tokens, confidence })
        })
    }
}

fn dtype_for(device: &Device, precision: Precision) -> DType {
    match precision {
        Precision::Half if !device.is_cpu() => DType::F16,
        _ => DType::F32,
    }
}

fn build_model(
    config: &Config,
    weights: &Path,
    dtype: DType,
    device: &Device,
) -> candle_core::Result<m::model::Whisper> {
    // SAFETY: the safetensors file lives in the local hub cache and is not
    // modified while mapped.
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], dtype, device)? };
    m::model::Whisper::load(&vb, config.clone())
}

fn ensure_finite(values: &[f32]) -> candle_core::Result<()> {
    if values.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(candle_core::Error::Msg("non-finite logits".to_string()))
    }
}

/// Map a candle failure to the lifecycle error taxonomy.
fn classify(error: candle_core::Error, precision: Precision) -> ModelError {
    let message = error.to_string();
    let lowered = message.to_lowercase();
    let half_dtype = precision == Precision::Half && lowered.contains("dtype");
    if lowered.contains("non-finite") || half_dtype {
        ModelError::numeric(precision, message)
    } else {
        ModelError::inference(message)
    }
}

/// Split `text` into words and spread `[start_s, end_s]` across them by length.
fn spread_words(text: &str, start_s: f64, end_s: f64) -> Vec<Token> {
    let units = split_units(text);
    let total: usize = units.iter().map(|u| u.chars().count()).sum();
    if total == 0 {
        return Vec::new();
    }

    let span = (end_s - start_s).max(0.0);
    let mut cursor = start_s;
    units
        .into_iter()
        .map(|unit| {
            let share = span * unit.chars().count() as f64 / total as f64;
            let token = Token { text: unit, start_s: Some(cursor), end_s: Some(cursor + share) };
            cursor += share;
            token
        })
        .collect()
}

/// Whitespace-separated words, with unspaced-script characters as their own units.
fn split_units(text: &str) -> Vec<String> {
    let mut units = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        if c.is_whitespace() || is_unspaced(c) {
            if !current.is_empty() {
                units.push(std::mem::take(&mut current));
            }
            if is_unspaced(c) {
                units.push(c.to_string());
            }
        } else {
            current.push(c);
        }
    }
    if !current.is_empty() {
        units.push(current);
    }
    units
}
