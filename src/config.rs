//! # Configuration Management
//!
//! Loads the service configuration from layered sources.
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Plain deployment variables (`PORT`, `VRAM_TTL`, `ASR_USE_HALF`, ...)
//! 2. `APP_`-prefixed environment variables with `__` between sections
//!    (`APP_MODELS__TTL_SECONDS=600`)
//! 3. Configuration file (`config.toml`)
//! 4. Default values (defined in the Default impls)
//!
//! ## Sections:
//! - `server`: bind address, worker count, API key
//! - `models`: weight cache, download mode, idle TTL, device, repositories, VAD tuning
//! - `precision`: global half-precision and fallback switches, with per-kind overrides
//! - `filters`: transcript filter thresholds and order
//! - `audio`: upload limits

use crate::device::DevicePreference;
use crate::engines::EnergyVadConfig;
use crate::pipeline::FilterConfig;
use crate::runtime::{ModelKind, PrecisionSettings, TtlReaper};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::env;
use std::time::Duration;

/// Plain environment variables and the config keys they override.
const ENV_OVERRIDES: [(&str, &str); 26] = [
    ("HOST", "server.host"),
    ("PORT", "server.port"),
    ("API_KEY", "server.api_key"),
    ("API_KEY_HEADER", "server.api_key_header"),
    ("MODEL_PATH", "models.model_path"),
    ("VRAM_TTL", "models.ttl_seconds"),
    ("MODEL_DOWNLOAD_MODE", "models.download_mode"),
    ("HF_TOKEN", "models.hf_token"),
    ("USE_HALF", "precision.use_half"),
    ("HALF_FALLBACK_FP32", "precision.fallback_enabled"),
    ("VAD_USE_HALF", "precision.vad.use_half"),
    ("LID_USE_HALF", "precision.lid.use_half"),
    ("ASR_USE_HALF", "precision.asr.use_half"),
    ("PUNC_USE_HALF", "precision.punc.use_half"),
    ("VAD_HALF_FALLBACK_FP32", "precision.vad.fallback_enabled"),
    ("LID_HALF_FALLBACK_FP32", "precision.lid.fallback_enabled"),
    ("ASR_HALF_FALLBACK_FP32", "precision.asr.fallback_enabled"),
    ("PUNC_HALF_FALLBACK_FP32", "precision.punc.fallback_enabled"),
    ("ASR_REPEAT_FILTER_ENABLED", "filters.repeat_filter_enabled"),
    ("ASR_MAX_CONSECUTIVE_TOKEN_REPEATS", "filters.max_consecutive_token_repeats"),
    ("ASR_MAX_CONSECUTIVE_CHAR_REPEATS", "filters.max_consecutive_char_repeats"),
    ("ASR_LOW_INFO_MIN_CHARS", "filters.low_info_min_units"),
    ("ASR_LOW_INFO_UNIQUE_RATIO", "filters.low_info_unique_ratio"),
    ("PROCESS_ALL_FILTER_SCRIPT_MISMATCH", "filters.script_mismatch_filter_enabled"),
    ("PROCESS_ALL_FILTER_MIN_CONFIDENCE", "filters.script_mismatch_min_confidence"),
    ("ASR_MAX_DECODE_TOKENS", "models.asr_max_decode_tokens"),
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub models: ModelsConfig,
    pub precision: PrecisionConfig,
    pub filters: FilterConfig,
    pub audio: AudioConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: usize,
    /// Empty disables authentication
    pub api_key: String,
    pub api_key_header: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            workers: 1,
            api_key: String::new(),
            api_key_header: "X-API-Key".to_string(),
        }
    }
}

/// When model weights are fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadMode {
    /// On the first request that needs the model
    #[default]
    Lazy,
    /// Before the server starts listening
    Startup,
}

impl std::fmt::Display for DownloadMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DownloadMode::Lazy => write!(f, "lazy"),
            DownloadMode::Startup => write!(f, "startup"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// Hugging Face hub cache directory
    pub model_path: String,
    pub download_mode: DownloadMode,
    /// Idle time before a loaded model is evicted; 0 disables eviction
    pub ttl_seconds: u64,
    /// Reaper tick; derived from the TTL when unset
    pub reaper_interval_seconds: Option<u64>,
    pub device: DevicePreference,
    pub asr_repo: String,
    pub lid_repo: String,
    pub asr_max_decode_tokens: usize,
    pub hf_token: Option<String>,
    pub vad: EnergyVadConfig,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            model_path: "./models".to_string(),
            download_mode: DownloadMode::Lazy,
            ttl_seconds: 300,
            reaper_interval_seconds: None,
            device: DevicePreference::Auto,
            asr_repo: "openai/whisper-base".to_string(),
            lid_repo: "openai/whisper-tiny".to_string(),
            asr_max_decode_tokens: 224,
            hf_token: None,
            vad: EnergyVadConfig::default(),
        }
    }
}

impl ModelsConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn reaper_interval(&self) -> Duration {
        match self.reaper_interval_seconds {
            Some(secs) => Duration::from_secs(secs),
            None => TtlReaper::interval_for(self.ttl()),
        }
    }
}

/// Per-kind override; unset fields inherit the global switch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindPrecisionConfig {
    pub use_half: Option<bool>,
    pub fallback_enabled: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrecisionConfig {
    pub use_half: bool,
    pub fallback_enabled: bool,
    pub vad: KindPrecisionConfig,
    pub lid: KindPrecisionConfig,
    pub asr: KindPrecisionConfig,
    pub punc: KindPrecisionConfig,
}

impl Default for PrecisionConfig {
    fn default() -> Self {
        let settings = PrecisionSettings::default();
        Self {
            use_half: settings.use_half,
            fallback_enabled: settings.fallback_enabled,
            vad: KindPrecisionConfig::default(),
            lid: KindPrecisionConfig::default(),
            asr: KindPrecisionConfig::default(),
            punc: KindPrecisionConfig::default(),
        }
    }
}

impl PrecisionConfig {
    /// Effective settings for `kind`.
    pub fn for_kind(&self, kind: ModelKind) -> PrecisionSettings {
        let overrides = match kind {
            ModelKind::Vad => self.vad,
            ModelKind::Lid => self.lid,
            ModelKind::Asr => self.asr,
            ModelKind::Punc => self.punc,
        };
        PrecisionSettings {
            use_half: overrides.use_half.unwrap_or(self.use_half),
            fallback_enabled: overrides.fallback_enabled.unwrap_or(self.fallback_enabled),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub max_upload_bytes: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self { max_upload_bytes: 50 * 1024 * 1024 }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the process environment.
    pub fn load() -> Result<Self> {
        Self::load_from(&env::vars().collect())
    }

    /// Load configuration with `vars` standing in for the process environment.
    pub fn load_from(vars: &HashMap<String, String>) -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .source(Some(vars.clone())),
            );

        for (var, key) in ENV_OVERRIDES {
            if let Some(value) = vars.get(var) {
                settings = settings.set_override(key, value.as_str())?;
            }
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject settings the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow!("Server port cannot be 0"));
        }
        if self.server.workers == 0 {
            return Err(anyhow!("Worker count must be greater than 0"));
        }
        if self.server.api_key_header.trim().is_empty() {
            return Err(anyhow!("API key header name cannot be empty"));
        }
        if self.models.asr_max_decode_tokens == 0 {
            return Err(anyhow!("ASR max decode tokens must be greater than 0"));
        }
        if self.models.reaper_interval_seconds == Some(0) {
            return Err(anyhow!("Reaper interval must be greater than 0"));
        }
        if self.audio.max_upload_bytes == 0 {
            return Err(anyhow!("Max upload size must be greater than 0"));
        }

        let filters = &self.filters;
        if filters.max_consecutive_token_repeats == 0 || filters.max_consecutive_char_repeats == 0 {
            return Err(anyhow!("Repeat caps must be greater than 0"));
        }
        if !(0.0..=1.0).contains(&filters.low_info_unique_ratio) {
            return Err(anyhow!("Low-information unique ratio must be within [0, 1]"));
        }
        if !(0.0..=1.0).contains(&filters.script_mismatch_min_confidence) {
            return Err(anyhow!("Script mismatch min confidence must be within [0, 1]"));
        }
        let mut seen = HashSet::new();
        if let Some(stage) = filters.order.iter().find(|stage| !seen.insert(**stage)) {
            return Err(anyhow!("Filter stage {:?} listed twice in filters.order", stage));
        }

        let vad = &self.models.vad;
        if vad.frame_ms == 0 {
            return Err(anyhow!("VAD frame length must be greater than 0"));
        }
        if !(0.0..=1.0).contains(&vad.energy_threshold) {
            return Err(anyhow!("VAD energy threshold must be within [0, 1]"));
        }

        Ok(())
    }
}
