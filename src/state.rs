//! # Application State
//!
//! Shared state handed to every request handler through `web::Data`.
//! Cloning is cheap: everything heavy sits behind an `Arc`.

use crate::audio::AudioNormalizer;
use crate::config::AppConfig;
use crate::device::DeviceSummary;
use crate::pipeline::PipelineOrchestrator;
use crate::runtime::ModelRegistry;
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub registry: Arc<ModelRegistry>,
    pub orchestrator: Arc<PipelineOrchestrator>,
    pub normalizer: AudioNormalizer,
    pub device: DeviceSummary,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        registry: Arc<ModelRegistry>,
        orchestrator: Arc<PipelineOrchestrator>,
        device: DeviceSummary,
    ) -> Self {
        let normalizer = AudioNormalizer::new(config.audio.max_upload_bytes);
        Self {
            config: Arc::new(config),
            registry,
            orchestrator,
            normalizer,
            device,
            start_time: Instant::now(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

#[cfg(test)]
pub mod test_support {
    //! State wired to in-memory fake models, for handler tests.

    use super::*;
    use crate::device::{DeviceManager, DevicePreference};
    use crate::pipeline::TextFilterChain;
    use crate::runtime::clock::ManualClock;
    use crate::runtime::testing::{FakeLoader, FakeWeights};
    use candle_core::Device;

    pub struct TestState {
        pub state: AppState,
        pub loader: Arc<FakeLoader>,
        pub weights: Arc<FakeWeights>,
    }

    pub fn test_state(config: AppConfig) -> TestState {
        test_state_with(config, FakeLoader::new())
    }

    pub fn test_state_with(config: AppConfig, loader: FakeLoader) -> TestState {
        let loader = Arc::new(loader);
        let weights = Arc::new(FakeWeights::default());
        let precision = config.precision.clone();
        let registry = Arc::new(ModelRegistry::new(
            loader.clone(),
            weights.clone(),
            Arc::new(ManualClock::new()),
            move |kind| precision.for_kind(kind),
        ));
        let orchestrator = Arc::new(PipelineOrchestrator::new(
            Arc::clone(&registry),
            TextFilterChain::new(config.filters.clone()),
        ));
        let device = DeviceManager::summarize(DevicePreference::Cpu, &Device::Cpu);

        TestState { state: AppState::new(config, registry, orchestrator, device), loader, weights }
    }
}
