//! Request and result types flowing through the orchestrator.

use crate::audio::AudioClip;
use crate::runtime::{LanguageGuess, ModelKind, SpeechSegment, Transcript};
use serde::Serialize;

#[derive(Debug, Clone)]
pub enum PipelineInput {
    Audio(AudioClip),
    /// Text for punctuation-only requests
    Text(String),
}

/// Which stages a request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StageSet {
    pub vad: bool,
    pub lid: bool,
    pub asr: bool,
    pub punc: bool,
}

impl StageSet {
    /// The combined VAD → LID → ASR → PUNC pipeline.
    pub fn all() -> Self {
        Self { vad: true, lid: true, asr: true, punc: true }
    }

    pub fn only(kind: ModelKind) -> Self {
        let mut stages = Self::default();
        match kind {
            ModelKind::Vad => stages.vad = true,
            ModelKind::Lid => stages.lid = true,
            ModelKind::Asr => stages.asr = true,
            ModelKind::Punc => stages.punc = true,
        }
        stages
    }

    #[cfg(test)]
    pub fn contains(&self, kind: ModelKind) -> bool {
        match kind {
            ModelKind::Vad => self.vad,
            ModelKind::Lid => self.lid,
            ModelKind::Asr => self.asr,
            ModelKind::Punc => self.punc,
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.vad || self.lid || self.asr || self.punc)
    }

    pub fn needs_audio(&self) -> bool {
        self.vad || self.lid || self.asr
    }
}

#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub uttid: String,
    pub input: PipelineInput,
    pub force_refresh: bool,
    pub stages: StageSet,
}

impl PipelineRequest {
    pub fn audio(uttid: impl Into<String>, clip: AudioClip, stages: StageSet) -> Self {
        Self {
            uttid: uttid.into(),
            input: PipelineInput::Audio(clip),
            force_refresh: false,
            stages,
        }
    }

    pub fn text(uttid: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            uttid: uttid.into(),
            input: PipelineInput::Text(text.into()),
            force_refresh: false,
            stages: StageSet::only(ModelKind::Punc),
        }
    }

    pub fn with_force_refresh(mut self, force_refresh: bool) -> Self {
        self.force_refresh = force_refresh;
        self
    }
}

/// One transcribed speech segment of the combined pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sentence {
    pub start_ms: u64,
    pub end_ms: u64,
    pub text: String,
    pub asr_confidence: Option<f32>,
    pub lang: Option<String>,
    pub lang_confidence: f32,
}

/// Token timing relative to the start of the clip.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Word {
    pub start_ms: u64,
    pub end_ms: u64,
    pub text: String,
}

/// Everything one request produced. Owned by that request only.
#[derive(Debug, Clone, Default)]
pub struct PipelineResult {
    pub uttid: String,
    pub duration_s: f64,
    /// Detected speech; `None` when VAD was not requested
    pub segments: Option<Vec<SpeechSegment>>,
    pub language: Option<LanguageGuess>,
    /// Filtered recognizer output, merged across segments
    pub transcript: Option<Transcript>,
    pub punctuated: Option<String>,
    pub sentences: Vec<Sentence>,
    pub words: Vec<Word>,
}

pub(crate) fn to_ms(seconds: f64) -> u64 {
    (seconds.max(0.0) * 1000.0).round() as u64
}
