//! # Precision Policy
//!
//! Decides, per slot, whether inference is attempted at reduced precision and
//! what happens when reduced precision misbehaves.
//!
//! ## Fallback-once semantics:
//! - A slot configured for half precision runs its first inference at half.
//! - A numeric failure at half, with fallback enabled, is retried exactly once
//!   at full precision.
//! - A successful retry pins the slot to full precision until the next load.
//! - Without fallback, or when the retry fails too, the error propagates.
//!
//! Models that cannot toggle precision always run at full precision.

use crate::runtime::backend::ModelCapabilities;
use crate::runtime::error::ModelError;
use crate::runtime::kind::ModelKind;
use serde::{Deserialize, Serialize};
use std::future::Future;
use tracing::{info, warn};

/// Numeric precision an inference runs at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Half,
    Full,
}

impl std::fmt::Display for Precision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Precision::Half => write!(f, "fp16"),
            Precision::Full => write!(f, "fp32"),
        }
    }
}

/// Configured precision behaviour for one kind, after per-kind overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionSettings {
    pub use_half: bool,
    pub fallback_enabled: bool,
}

impl Default for PrecisionSettings {
    fn default() -> Self {
        Self { use_half: false, fallback_enabled: true }
    }
}

/// Live precision state of a loaded slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionPolicy {
    use_half: bool,
    fallback_enabled: bool,
    resolved: bool,
    pinned_full: bool,
}

impl PrecisionPolicy {
    /// Resolve the policy at load time.
    ///
    /// Half precision is dropped when the model does not accept the toggle.
    pub fn resolve(
        kind: ModelKind,
        settings: PrecisionSettings,
        capabilities: ModelCapabilities,
    ) -> Self {
        let use_half = if settings.use_half && !capabilities.supports_precision_toggle {
            info!(
                kind = %kind,
                "Model does not support a precision toggle, running at full precision"
            );
            false
        } else {
            settings.use_half
        };

        Self {
            use_half,
            fallback_enabled: settings.fallback_enabled,
            resolved: false,
            pinned_full: false,
        }
    }

    /// Precision the next inference starts at.
    pub fn attempt(&self) -> Precision {
        if self.use_half && !self.pinned_full {
            Precision::Half
        } else {
            Precision::Full
        }
    }

    pub fn use_half(&self) -> bool {
        self.use_half
    }

    pub fn fallback_enabled(&self) -> bool {
        self.fallback_enabled
    }

    /// True once an inference has succeeded since the last load.
    pub fn is_resolved(&self) -> bool {
        self.resolved
    }

    #[cfg(test)]
    pub fn is_pinned_full(&self) -> bool {
        self.pinned_full
    }

    fn should_fall_back(&self, attempted: Precision, error: &ModelError) -> bool {
        attempted == Precision::Half && self.fallback_enabled && error.is_numeric()
    }

    fn record_success(&mut self, precision: Precision) {
        self.resolved = true;
        if self.use_half && precision == Precision::Full {
            self.pinned_full = true;
        }
    }
}

/// Run one inference under `policy`, retrying at full precision at most once.
///
/// `attempt` is invoked with the precision to run at and may be called twice.
pub async fn run_with_fallback<T, F, Fut>(
    policy: &mut PrecisionPolicy,
    kind: ModelKind,
    mut attempt: F,
) -> Result<T, ModelError>
where
    F: FnMut(Precision) -> Fut,
    Fut: Future<Output = Result<T, ModelError>>,
{
    let first = policy.attempt();
    match attempt(first).await {
        Ok(value) => {
            policy.record_success(first);
            Ok(value)
        }
        Err(error) if policy.should_fall_back(first, &error) => {
            warn!(
                kind = %kind,
                error = %error,
                "Half precision inference failed, retrying at full precision"
            );
            let value = attempt(Precision::Full).await?;
            policy.record_success(Precision::Full);
            info!(kind = %kind, "Slot pinned to full precision until next load");
            Ok(value)
        }
        Err(error) => Err(error),
    }
}
