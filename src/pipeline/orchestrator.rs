//! # Pipeline Orchestrator
//!
//! Sequences the requested stages for one request:
//! VAD → LID → ASR → filter chain → PUNC.
//!
//! ## Stage Rules:
//! - VAD restricts every later stage to the detected speech; no speech
//!   means the whole clip is treated as one segment
//! - LID runs once over the concatenated speech
//! - ASR runs per speech segment, and each transcript goes through the
//!   filter chain with the LID result (script filtering needs it)
//! - PUNC runs per surviving segment; the script filter is applied again to
//!   the punctuated sentence
//!
//! Single-stage requests are one-stage pipelines through the same path.
//! Every model is reached through `registry.acquire`, and each handle is
//! dropped as soon as its stage is done.

use crate::audio::AudioClip;
use crate::pipeline::filters::{render_tokens, TextFilterChain};
use crate::pipeline::types::{
    to_ms, PipelineInput, PipelineRequest, PipelineResult, Sentence, StageSet, Word,
};
use crate::runtime::{
    LanguageGuess, ModelError, ModelKind, ModelRegistry, SpeechSegment, Token, Transcript,
};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info};

/// Markers some recognizers emit for non-speech.
const NON_SPEECH_MARKERS: [&str; 2] = ["<blank>", "<sil>"];

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("Invalid pipeline request: {0}")]
    InvalidRequest(String),
}

pub struct PipelineOrchestrator {
    registry: Arc<ModelRegistry>,
    filters: TextFilterChain,
}

impl PipelineOrchestrator {
    pub fn new(registry: Arc<ModelRegistry>, filters: TextFilterChain) -> Self {
        Self { registry, filters }
    }

    /// Run `request` through its stages.
    ///
    /// `force_refresh` is logged only; resident models are never unloaded
    /// on the request path.
    pub async fn run(&self, request: PipelineRequest) -> Result<PipelineResult, PipelineError> {
        let PipelineRequest { uttid, input, force_refresh, stages } = request;

        if stages.is_empty() {
            return Err(PipelineError::InvalidRequest("no stages requested".into()));
        }
        if force_refresh {
            info!(uttid = %uttid, "force_refresh requested, resident models are kept");
        }

        match input {
            PipelineInput::Text(text) => {
                if stages.needs_audio() {
                    return Err(PipelineError::InvalidRequest(
                        "audio stages need audio input".into(),
                    ));
                }
                let punctuated =
                    self.punctuate(vec![text.clone()]).await?.pop().unwrap_or_default();
                Ok(PipelineResult {
                    uttid,
                    transcript: Some(Transcript { text, ..Default::default() }),
                    punctuated: Some(punctuated),
                    ..Default::default()
                })
            }
            PipelineInput::Audio(clip) => self.run_audio(uttid, clip, stages).await,
        }
    }

    async fn run_audio(
        &self,
        uttid: String,
        clip: AudioClip,
        stages: StageSet,
    ) -> Result<PipelineResult, PipelineError> {
        if clip.is_empty() {
            return Err(PipelineError::InvalidRequest("audio contains no samples".into()));
        }

        let started = Instant::now();
        let mut result =
            PipelineResult { uttid, duration_s: clip.duration_s(), ..Default::default() };

        let mut regions = vec![SpeechSegment { start_s: 0.0, end_s: clip.duration_s() }];
        if stages.vad {
            let segments = self.detect(&clip).await?;
            if segments.is_empty() {
                debug!(uttid = %result.uttid, "No speech detected, using the whole clip");
            } else {
                regions = segments.clone();
            }
            result.segments = Some(segments);
        }

        if stages.lid {
            let speech: Vec<f32> =
                regions.iter().flat_map(|region| clip.slice(region).iter().copied()).collect();
            result.language = Some(self.identify(speech).await?);
        }

        if stages.asr {
            let language = result.language.clone();
            let pieces = self.transcribe(&clip, &regions, language.as_ref()).await?;
            self.assemble(&mut result, pieces, language.as_ref(), stages.punc).await?;
        }

        info!(
            uttid = %result.uttid,
            duration_s = result.duration_s,
            segments = regions.len(),
            sentences = result.sentences.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Pipeline finished"
        );
        Ok(result)
    }

    async fn detect(&self, clip: &AudioClip) -> Result<Vec<SpeechSegment>, ModelError> {
        let samples = clip.shared();
        let duration = clip.duration_s();

        let mut handle = self.registry.acquire(ModelKind::Vad).await?;
        let mut segments = handle
            .run(move |model, precision| model.as_vad()?.detect(&samples, precision))
            .await?;
        drop(handle);

        for segment in &mut segments {
            segment.start_s = segment.start_s.clamp(0.0, duration);
            segment.end_s = segment.end_s.clamp(0.0, duration);
        }
        segments.retain(|segment| segment.end_s > segment.start_s);
        segments.sort_by(|a, b| a.start_s.total_cmp(&b.start_s));
        Ok(segments)
    }

    async fn identify(&self, speech: Vec<f32>) -> Result<LanguageGuess, ModelError> {
        let mut handle = self.registry.acquire(ModelKind::Lid).await?;
        let mut guess = handle
            .run(move |model, precision| model.as_lid()?.identify(&speech, precision))
            .await?;
        guess.confidence = guess.confidence.clamp(0.0, 1.0);
        Ok(guess)
    }

    /// Transcribe and filter each region, keeping the ones with text left.
    async fn transcribe(
        &self,
        clip: &AudioClip,
        regions: &[SpeechSegment],
        language: Option<&LanguageGuess>,
    ) -> Result<Vec<(SpeechSegment, Transcript)>, ModelError> {
        let mut pieces = Vec::with_capacity(regions.len());
        let mut handle = self.registry.acquire(ModelKind::Asr).await?;

        for region in regions {
            let samples = clip.slice(region).to_vec();
            if samples.is_empty() {
                continue;
            }
            let transcript = handle
                .run(move |model, precision| model.as_asr()?.transcribe(&samples, precision))
                .await?;

            let Some(transcript) = strip_non_speech(transcript) else {
                debug!(start_s = region.start_s, "Segment transcribed as non-speech");
                continue;
            };
            let filtered = self.filters.apply(transcript, language);
            if filtered.text.is_empty() && filtered.tokens.is_empty() {
                debug!(start_s = region.start_s, "Segment emptied by text filters");
                continue;
            }
            pieces.push((*region, filtered));
        }
        Ok(pieces)
    }

    /// Restore punctuation on each text. Blank texts never reach the model.
    async fn punctuate(&self, texts: Vec<String>) -> Result<Vec<String>, ModelError> {
        if texts.iter().all(|text| text.trim().is_empty()) {
            return Ok(vec![String::new(); texts.len()]);
        }

        let mut handle = self.registry.acquire(ModelKind::Punc).await?;
        let mut restored = Vec::with_capacity(texts.len());
        for text in texts {
            if text.trim().is_empty() {
                restored.push(String::new());
                continue;
            }
            let punctuated = handle
                .run(move |model, precision| model.as_punc()?.restore(&text, precision))
                .await?;
            restored.push(punctuated);
        }
        Ok(restored)
    }

    async fn assemble(
        &self,
        result: &mut PipelineResult,
        pieces: Vec<(SpeechSegment, Transcript)>,
        language: Option<&LanguageGuess>,
        punctuate: bool,
    ) -> Result<(), ModelError> {
        let raw_texts: Vec<String> =
            pieces.iter().map(|(_, transcript)| transcript.text.clone()).collect();
        let texts = if punctuate {
            self.punctuate(raw_texts.clone()).await?
        } else {
            raw_texts.clone()
        };

        let mut tokens = Vec::new();
        let mut confidences = Vec::new();

        for ((region, transcript), text) in pieces.into_iter().zip(texts) {
            let text = match language {
                Some(language) => self.filters.filter_sentence(&text, language),
                None => text.trim().to_string(),
            };
            if let Some(confidence) = transcript.confidence {
                confidences.push(confidence);
            }

            let shifted: Vec<Token> =
                transcript.tokens.into_iter().map(|t| t.shifted(region.start_s)).collect();
            result.words.extend(shifted.iter().filter_map(|token| {
                Some(Word {
                    start_ms: to_ms(token.start_s?),
                    end_ms: to_ms(token.end_s?),
                    text: token.text.clone(),
                })
            }));
            tokens.extend(shifted);

            if text.is_empty() {
                continue;
            }
            result.sentences.push(Sentence {
                start_ms: to_ms(region.start_s),
                end_ms: to_ms(region.end_s),
                text,
                asr_confidence: transcript.confidence,
                lang: language.map(|l| l.lang.clone()),
                lang_confidence: language.map(|l| l.confidence).unwrap_or(0.0),
            });
        }

        let confidence = (!confidences.is_empty())
            .then(|| confidences.iter().sum::<f32>() / confidences.len() as f32);
        result.transcript = Some(Transcript { text: join_texts(&raw_texts), tokens, confidence });

        if punctuate {
            let sentence_texts: Vec<String> =
                result.sentences.iter().map(|s| s.text.clone()).collect();
            result.punctuated = Some(join_texts(&sentence_texts));
        }
        Ok(())
    }
}

fn join_texts(texts: &[String]) -> String {
    let parts: Vec<Token> = texts.iter().map(|text| Token::untimed(text.as_str())).collect();
    render_tokens(&parts)
}

/// Remove non-speech markers; `None` when nothing else is left.
fn strip_non_speech(mut transcript: Transcript) -> Option<Transcript> {
    let has_marker = |text: &str| NON_SPEECH_MARKERS.iter().any(|marker| text.contains(marker));
    if !has_marker(&transcript.text) && !transcript.tokens.iter().any(|t| has_marker(&t.text)) {
        return Some(transcript);
    }

    let mut text = transcript.text.clone();
    for marker in NON_SPEECH_MARKERS {
        text = text.replace(marker, " ");
    }
    transcript.text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    transcript.tokens.retain(|token| !NON_SPEECH_MARKERS.contains(&token.text.trim()));

    if transcript.text.is_empty() && transcript.tokens.is_empty() {
        None
    } else {
        Some(transcript)
    }
}
