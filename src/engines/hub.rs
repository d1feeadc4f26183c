//! # Hugging Face Weight Store
//!
//! Resolves model weights through the Hugging Face hub cache under the
//! configured model path. Only the Whisper-backed kinds (ASR, LID) have files;
//! the energy detector and rule punctuator need none.

use crate::runtime::backend::{WeightFiles, WeightStore};
use crate::runtime::{ModelError, ModelKind};
use async_trait::async_trait;
use hf_hub::api::tokio::{Api, ApiBuilder};
use hf_hub::Cache;
use std::path::PathBuf;
use tracing::{debug, info};

/// Files a Whisper repository must provide.
pub const WHISPER_FILES: &[&str] = &["config.json", "tokenizer.json", "model.safetensors"];

#[derive(Debug, Clone)]
pub struct HubWeightStore {
    cache_dir: PathBuf,
    token: Option<String>,
    asr_repo: String,
    lid_repo: String,
}

impl HubWeightStore {
    pub fn new(
        cache_dir: impl Into<PathBuf>,
        asr_repo: impl Into<String>,
        lid_repo: impl Into<String>,
    ) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            token: None,
            asr_repo: asr_repo.into(),
            lid_repo: lid_repo.into(),
        }
    }

    /// Access token for gated or private repositories.
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.is_empty());
        self
    }

    /// Repository and file list for `kind`, `None` when it needs no weights.
    pub fn files_for(&self, kind: ModelKind) -> Option<(&str, &'static [&'static str])> {
        match kind {
            ModelKind::Asr => Some((self.asr_repo.as_str(), WHISPER_FILES)),
            ModelKind::Lid => Some((self.lid_repo.as_str(), WHISPER_FILES)),
            ModelKind::Vad | ModelKind::Punc => None,
        }
    }

    fn api(&self, kind: ModelKind) -> Result<Api, ModelError> {
        ApiBuilder::new()
            .with_cache_dir(self.cache_dir.clone())
            .with_token(self.token.clone())
            .with_progress(false)
            .build()
            .map_err(|e| ModelError::download(kind, format!("hub client init failed: {}", e)))
    }
}

#[async_trait]
impl WeightStore for HubWeightStore {
    fn is_present(&self, kind: ModelKind) -> bool {
        let Some((repo, files)) = self.files_for(kind) else {
            return true;
        };
        let cached = Cache::new(self.cache_dir.clone()).model(repo.to_string());
        files.iter().all(|file| cached.get(file).is_some())
    }

    async fn fetch(&self, kind: ModelKind) -> Result<WeightFiles, ModelError> {
        let mut weights = WeightFiles::new();
        let Some((repo, files)) = self.files_for(kind) else {
            return Ok(weights);
        };

        let cached = Cache::new(self.cache_dir.clone()).model(repo.to_string());
        let mut api_repo = None;

        for &file in files {
            if let Some(path) = cached.get(file) {
                debug!(kind = %kind, file, "Using cached weight file");
                weights.insert(file, path);
                continue;
            }

            let handle = match api_repo.take() {
                Some(handle) => handle,
                None => self.api(kind)?.model(repo.to_string()),
            };
            info!(kind = %kind, repo, file, "Downloading weight file");
            let path = handle
                .get(file)
                .await
                .map_err(|e| ModelError::download(kind, format!("{}/{}: {}", repo, file, e)))?;
            weights.insert(file, path);
            api_repo = Some(handle);
        }

        Ok(weights)
    }
}
