//! # Model Engines
//!
//! Concrete backends behind the four model kinds.
//!
//! ## Backends:
//! - **VAD**: [`EnergyVad`], frame-energy speech detector
//! - **LID / ASR**: [`WhisperEngine`] on candle, one instance per slot
//! - **PUNC**: [`RulePunctuator`], rule-based restoration
//!
//! Only the Whisper backends support the half-precision toggle.

pub mod energy_vad;
pub mod hub;
pub mod mel;
pub mod punctuation;
pub mod whisper;

pub use energy_vad::{EnergyVad, EnergyVadConfig};
pub use hub::HubWeightStore;
pub use punctuation::RulePunctuator;
pub use whisper::WhisperEngine;

use crate::runtime::backend::{LoadedModel, ModelCapabilities, ModelLoader, WeightFiles};
use crate::runtime::{ModelError, ModelKind, Precision};
use candle_core::Device;
use tracing::debug;

/// Builds every model kind on one compute device.
pub struct DefaultModelLoader {
    device: Device,
    vad: EnergyVadConfig,
    asr_max_decode_tokens: usize,
}

impl DefaultModelLoader {
    pub fn new(device: Device, vad: EnergyVadConfig, asr_max_decode_tokens: usize) -> Self {
        Self { device, vad, asr_max_decode_tokens }
    }
}

impl ModelLoader for DefaultModelLoader {
    /// Whisper toggles between F16 and F32 weights, but only on an
    /// accelerator; on the CPU it always runs F32.
    fn capabilities(&self, kind: ModelKind) -> ModelCapabilities {
        let whisper = matches!(kind, ModelKind::Asr | ModelKind::Lid);
        ModelCapabilities {
            supports_precision_toggle: whisper && !self.device.is_cpu(),
        }
    }

    fn load(
        &self,
        kind: ModelKind,
        weights: &WeightFiles,
        precision: Precision,
    ) -> Result<LoadedModel, ModelError> {
        debug!(kind = %kind, precision = %precision, "Building model instance");
        let model = match kind {
            ModelKind::Vad => LoadedModel::Vad(Box::new(EnergyVad::new(self.vad.clone()))),
            ModelKind::Punc => LoadedModel::Punc(Box::new(RulePunctuator::new())),
            ModelKind::Lid => LoadedModel::Lid(Box::new(WhisperEngine::load(
                kind,
                weights,
                self.device.clone(),
                precision,
                self.asr_max_decode_tokens,
            )?)),
            ModelKind::Asr => LoadedModel::Asr(Box::new(WhisperEngine::load(
                kind,
                weights,
                self.device.clone(),
                precision,
                self.asr_max_decode_tokens,
            )?)),
        };
        Ok(model)
    }

    fn reclaim(&self, kind: ModelKind) -> Result<(), ModelError> {
        if self.device.is_cpu() {
            return Ok(());
        }
        self.device
            .synchronize()
            .map_err(|e| ModelError::Release { kind, message: e.to_string() })
    }
}
