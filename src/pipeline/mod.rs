//! # Speech Pipeline
//!
//! Stage sequencing and transcript post-filtering on top of the model runtime.

pub mod filters;
pub mod orchestrator;
pub mod script;
pub mod types;

pub use filters::{FilterConfig, TextFilterChain};
pub use orchestrator::{PipelineError, PipelineOrchestrator};
pub use types::{PipelineRequest, PipelineResult, Sentence, StageSet, Word};
