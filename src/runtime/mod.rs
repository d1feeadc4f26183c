//! # Model Runtime
//!
//! Lifecycle management for the service's heavyweight models: one slot per
//! kind, lazy single-flight loading, precision fallback, and idle eviction.

pub mod backend;
pub mod clock;
pub mod error;
pub mod kind;
pub mod precision;
pub mod reaper;
pub mod registry;
pub mod slot;

#[cfg(test)]
pub mod testing;

pub use backend::{LanguageGuess, SpeechSegment, Token, Transcript};
pub use clock::SystemClock;
pub use error::ModelError;
pub use kind::ModelKind;
pub use precision::{Precision, PrecisionSettings};
pub use reaper::TtlReaper;
pub use registry::{ModelRegistry, SlotReport};
pub use slot::SlotStatus;
