//! Error types for the model lifecycle layer.

use crate::runtime::kind::ModelKind;
use crate::runtime::precision::Precision;
use thiserror::Error;

/// Failures raised while fetching, loading, running or releasing a model.
///
/// `Clone` so that a single failed load attempt can be handed to every
/// request that was waiting on it.
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    /// The model failed to initialize. Never cached; the next request retries.
    #[error("Model load failed for {kind}: {message}")]
    Load { kind: ModelKind, message: String },

    /// Weights are not present locally and could not be fetched.
    #[error("Model weights unavailable for {kind}: {message}")]
    Download { kind: ModelKind, message: String },

    /// Reduced precision produced non-finite values or was rejected by the model.
    #[error("Numeric failure at {precision} precision: {message}")]
    NumericFailure { precision: Precision, message: String },

    /// Any other inference failure.
    #[error("Inference error: {0}")]
    Inference(String),

    /// The loader returned a model for a different slot.
    #[error("Slot {expected} received a {actual} model")]
    WrongKind { expected: ModelKind, actual: ModelKind },

    /// Releasing an instance did not free its resources.
    #[error("Release failed for {kind}: {message}")]
    Release { kind: ModelKind, message: String },
}

impl ModelError {
    pub fn load(kind: ModelKind, message: impl Into<String>) -> Self {
        ModelError::Load { kind, message: message.into() }
    }

    pub fn download(kind: ModelKind, message: impl Into<String>) -> Self {
        ModelError::Download { kind, message: message.into() }
    }

    pub fn numeric(precision: Precision, message: impl Into<String>) -> Self {
        ModelError::NumericFailure { precision, message: message.into() }
    }

    pub fn inference(message: impl Into<String>) -> Self {
        ModelError::Inference(message.into())
    }

    /// Load and download failures are transient from the caller's view.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, ModelError::Load { .. } | ModelError::Download { .. })
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, ModelError::NumericFailure { .. })
    }
}
