//! # Model Kinds
//!
//! The four logical models the service manages. Each kind owns exactly one
//! slot in the registry, so a kind doubles as the slot identity.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// One logical model managed by the registry.
///
/// ## Pipeline order:
/// Vad → Lid → Asr → Punc for the combined endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    /// Voice activity detection (speech segment boundaries)
    Vad,
    /// Language identification
    Lid,
    /// Automatic speech recognition
    Asr,
    /// Punctuation restoration
    Punc,
}

impl ModelKind {
    /// Every kind, in pipeline order.
    pub const ALL: [ModelKind; 4] =
        [ModelKind::Vad, ModelKind::Lid, ModelKind::Asr, ModelKind::Punc];

    /// Stable position of this kind inside [`ModelKind::ALL`].
    pub fn index(self) -> usize {
        match self {
            ModelKind::Vad => 0,
            ModelKind::Lid => 1,
            ModelKind::Asr => 2,
            ModelKind::Punc => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ModelKind::Vad => "vad",
            ModelKind::Lid => "lid",
            ModelKind::Asr => "asr",
            ModelKind::Punc => "punc",
        }
    }

    /// Get a human-readable description.
    pub fn description(self) -> &'static str {
        match self {
            ModelKind::Vad => "Speech endpoint detection",
            ModelKind::Lid => "Spoken language identification",
            ModelKind::Asr => "Speech transcription",
            ModelKind::Punc => "Punctuation restoration",
        }
    }
}

impl std::str::FromStr for ModelKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "vad" => Ok(ModelKind::Vad),
            "lid" => Ok(ModelKind::Lid),
            "asr" => Ok(ModelKind::Asr),
            "punc" | "punctuation" => Ok(ModelKind::Punc),
            _ => Err(anyhow!("Unknown model kind: {}", s)),
        }
    }
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
