//! # Model Backends
//!
//! The seams between the lifecycle manager and the models it manages.
//!
//! ## Pieces:
//! - [`WeightStore`]: makes weight files available on local disk
//! - [`ModelLoader`]: turns weight files into a [`LoadedModel`] and releases it
//! - Stage traits ([`VoiceActivityDetector`], [`LanguageIdentifier`],
//!   [`Transcriber`], [`PunctuationRestorer`]): the inference surface of each kind
//!
//! All audio handed to a stage is 16 kHz mono `f32` PCM.

use crate::runtime::error::ModelError;
use crate::runtime::kind::ModelKind;
use crate::runtime::precision::Precision;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A stretch of speech, in seconds from the start of the clip.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SpeechSegment {
    pub start_s: f64,
    pub end_s: f64,
}

/// Language identification result. `confidence` is in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LanguageGuess {
    pub lang: String,
    pub confidence: f32,
}

/// One recognized unit, with timing when the recognizer reports it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Token {
    pub text: String,
    pub start_s: Option<f64>,
    pub end_s: Option<f64>,
}

impl Token {
    pub fn untimed(text: impl Into<String>) -> Self {
        Self { text: text.into(), start_s: None, end_s: None }
    }

    /// Shift timings by `offset_s`, used when a segment is cut from a longer clip.
    pub fn shifted(mut self, offset_s: f64) -> Self {
        self.start_s = self.start_s.map(|s| s + offset_s);
        self.end_s = self.end_s.map(|s| s + offset_s);
        self
    }
}

/// Recognizer output for one stretch of audio.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Transcript {
    pub text: String,
    pub tokens: Vec<Token>,
    pub confidence: Option<f32>,
}

pub trait VoiceActivityDetector: Send + Sync {
    fn detect(&self, samples: &[f32], precision: Precision)
        -> Result<Vec<SpeechSegment>, ModelError>;
}

pub trait LanguageIdentifier: Send + Sync {
    fn identify(&self, samples: &[f32], precision: Precision) -> Result<LanguageGuess, ModelError>;
}

pub trait Transcriber: Send + Sync {
    fn transcribe(&self, samples: &[f32], precision: Precision) -> Result<Transcript, ModelError>;
}

pub trait PunctuationRestorer: Send + Sync {
    fn restore(&self, text: &str, precision: Precision) -> Result<String, ModelError>;
}

/// A resident model instance. Exactly one variant per [`ModelKind`].
pub enum LoadedModel {
    Vad(Box<dyn VoiceActivityDetector>),
    Lid(Box<dyn LanguageIdentifier>),
    Asr(Box<dyn Transcriber>),
    Punc(Box<dyn PunctuationRestorer>),
}

impl LoadedModel {
    pub fn kind(&self) -> ModelKind {
        match self {
            LoadedModel::Vad(_) => ModelKind::Vad,
            LoadedModel::Lid(_) => ModelKind::Lid,
            LoadedModel::Asr(_) => ModelKind::Asr,
            LoadedModel::Punc(_) => ModelKind::Punc,
        }
    }

    pub fn as_vad(&self) -> Result<&dyn VoiceActivityDetector, ModelError> {
        match self {
            LoadedModel::Vad(model) => Ok(model.as_ref()),
            other => Err(ModelError::WrongKind { expected: ModelKind::Vad, actual: other.kind() }),
        }
    }

    pub fn as_lid(&self) -> Result<&dyn LanguageIdentifier, ModelError> {
        match self {
            LoadedModel::Lid(model) => Ok(model.as_ref()),
            other => Err(ModelError::WrongKind { expected: ModelKind::Lid, actual: other.kind() }),
        }
    }

    pub fn as_asr(&self) -> Result<&dyn Transcriber, ModelError> {
        match self {
            LoadedModel::Asr(model) => Ok(model.as_ref()),
            other => Err(ModelError::WrongKind { expected: ModelKind::Asr, actual: other.kind() }),
        }
    }

    pub fn as_punc(&self) -> Result<&dyn PunctuationRestorer, ModelError> {
        match self {
            LoadedModel::Punc(model) => Ok(model.as_ref()),
            other => Err(ModelError::WrongKind { expected: ModelKind::Punc, actual: other.kind() }),
        }
    }
}

impl std::fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LoadedModel({})", self.kind())
    }
}

/// What a model supports, fixed at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModelCapabilities {
    pub supports_precision_toggle: bool,
}

/// Local paths of the weight files for one kind, keyed by file name.
#[derive(Debug, Clone, Default)]
pub struct WeightFiles {
    files: HashMap<String, PathBuf>,
}

impl WeightFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, path: PathBuf) {
        self.files.insert(name.into(), path);
    }

    pub fn get(&self, kind: ModelKind, name: &str) -> Result<&Path, ModelError> {
        self.files
            .get(name)
            .map(PathBuf::as_path)
            .ok_or_else(|| ModelError::load(kind, format!("weight file {} missing", name)))
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Ensures weights for a kind are on local disk.
#[async_trait]
pub trait WeightStore: Send + Sync {
    /// True when every file for `kind` is already cached locally. Never downloads.
    fn is_present(&self, kind: ModelKind) -> bool;

    /// Fetch missing files and return local paths. Fails with [`ModelError::Download`].
    async fn fetch(&self, kind: ModelKind) -> Result<WeightFiles, ModelError>;
}

/// Builds and releases model instances. Called from blocking threads.
pub trait ModelLoader: Send + Sync {
    fn capabilities(&self, kind: ModelKind) -> ModelCapabilities;

    fn load(
        &self,
        kind: ModelKind,
        weights: &WeightFiles,
        precision: Precision,
    ) -> Result<LoadedModel, ModelError>;

    /// Return freed accelerator memory to the device.
    fn reclaim(&self, _kind: ModelKind) -> Result<(), ModelError> {
        Ok(())
    }

    /// Drop the last reference to `model` and reclaim memory.
    fn unload(&self, kind: ModelKind, model: Arc<LoadedModel>) -> Result<(), ModelError> {
        match Arc::try_unwrap(model) {
            Ok(model) => drop(model),
            Err(_) => {
                return Err(ModelError::Release {
                    kind,
                    message: "instance still referenced by a running inference".to_string(),
                })
            }
        }
        self.reclaim(kind)
    }
}
