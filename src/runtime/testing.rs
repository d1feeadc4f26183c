//! In-memory weight store and loader for lifecycle and pipeline tests.

use crate::runtime::backend::{
    LanguageGuess, LanguageIdentifier, LoadedModel, ModelCapabilities, ModelLoader,
    PunctuationRestorer, SpeechSegment, Token, Transcriber, Transcript, VoiceActivityDetector,
    WeightFiles, WeightStore,
};
use crate::runtime::error::ModelError;
use crate::runtime::kind::ModelKind;
use crate::runtime::precision::Precision;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct Counters {
    loads: [AtomicUsize; 4],
    active_loads: AtomicUsize,
    /// Most loads observed running at the same time.
    pub peak_loads: AtomicUsize,
    pub half_runs: AtomicUsize,
    pub full_runs: AtomicUsize,
    pub releases: AtomicUsize,
}

impl Counters {
    pub fn loads(&self, kind: ModelKind) -> usize {
        self.loads[kind.index()].load(Ordering::SeqCst)
    }

    pub fn total_loads(&self) -> usize {
        ModelKind::ALL.iter().map(|&kind| self.loads(kind)).sum()
    }
}

#[derive(Debug, Default)]
pub struct FakeWeights {
    pub offline: AtomicBool,
    pub fetches: AtomicUsize,
    present: Mutex<HashSet<ModelKind>>,
}

impl FakeWeights {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WeightStore for FakeWeights {
    fn is_present(&self, kind: ModelKind) -> bool {
        self.present.lock().unwrap().contains(&kind)
    }

    async fn fetch(&self, kind: ModelKind) -> Result<WeightFiles, ModelError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ModelError::download(kind, "hub unreachable"));
        }
        if self.present.lock().unwrap().insert(kind) {
            self.fetches.fetch_add(1, Ordering::SeqCst);
        }
        Ok(WeightFiles::new())
    }
}

pub struct FakeLoader {
    load_delay: Duration,
    toggle: bool,
    half_fails: bool,
    failing_loads: AtomicUsize,
    language: LanguageGuess,
    transcript: Transcript,
    pub counters: Arc<Counters>,
}

impl FakeLoader {
    pub fn new() -> Self {
        Self {
            load_delay: Duration::ZERO,
            toggle: false,
            half_fails: false,
            failing_loads: AtomicUsize::new(0),
            language: LanguageGuess { lang: "en".to_string(), confidence: 0.93 },
            transcript: Transcript {
                text: "hello world".to_string(),
                tokens: vec![
                    Token { text: "hello".to_string(), start_s: Some(0.0), end_s: Some(0.4) },
                    Token { text: "world".to_string(), start_s: Some(0.4), end_s: Some(0.8) },
                ],
                confidence: Some(0.87),
            },
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    pub fn with_precision_toggle(mut self) -> Self {
        self.toggle = true;
        self
    }

    /// Every half-precision inference fails numerically.
    pub fn half_fails(mut self) -> Self {
        self.half_fails = true;
        self
    }

    /// The next `count` loads fail.
    pub fn failing_loads(self, count: usize) -> Self {
        self.failing_loads.store(count, Ordering::SeqCst);
        self
    }

    pub fn with_language(mut self, lang: &str, confidence: f32) -> Self {
        self.language = LanguageGuess { lang: lang.to_string(), confidence };
        self
    }

    pub fn with_transcript(mut self, transcript: Transcript) -> Self {
        self.transcript = transcript;
        self
    }
}

impl ModelLoader for FakeLoader {
    fn capabilities(&self, _kind: ModelKind) -> ModelCapabilities {
        ModelCapabilities { supports_precision_toggle: self.toggle }
    }

    fn load(
        &self,
        kind: ModelKind,
        _weights: &WeightFiles,
        _precision: Precision,
    ) -> Result<LoadedModel, ModelError> {
        let active = self.counters.active_loads.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak_loads.fetch_max(active, Ordering::SeqCst);
        std::thread::sleep(self.load_delay);
        self.counters.active_loads.fetch_sub(1, Ordering::SeqCst);
        self.counters.loads[kind.index()].fetch_add(1, Ordering::SeqCst);

        let remaining = self.failing_loads.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_loads.store(remaining - 1, Ordering::SeqCst);
            return Err(ModelError::load(kind, "simulated initialization failure"));
        }

        let model = FakeModel {
            counters: Arc::clone(&self.counters),
            half_fails: self.half_fails,
            language: self.language.clone(),
            transcript: self.transcript.clone(),
        };
        Ok(match kind {
            ModelKind::Vad => LoadedModel::Vad(Box::new(model)),
            ModelKind::Lid => LoadedModel::Lid(Box::new(model)),
            ModelKind::Asr => LoadedModel::Asr(Box::new(model)),
            ModelKind::Punc => LoadedModel::Punc(Box::new(model)),
        })
    }
}

struct FakeModel {
    counters: Arc<Counters>,
    half_fails: bool,
    language: LanguageGuess,
    transcript: Transcript,
}

impl FakeModel {
    fn check(&self, precision: Precision) -> Result<(), ModelError> {
        match precision {
            Precision::Half => {
                self.counters.half_runs.fetch_add(1, Ordering::SeqCst);
                if self.half_fails {
                    return Err(ModelError::numeric(precision, "non-finite logits"));
                }
            }
            Precision::Full => {
                self.counters.full_runs.fetch_add(1, Ordering::SeqCst);
            }
        }
        Ok(())
    }
}

impl Drop for FakeModel {
    fn drop(&mut self) {
        self.counters.releases.fetch_add(1, Ordering::SeqCst);
    }
}

impl VoiceActivityDetector for FakeModel {
    fn detect(
        &self,
        samples: &[f32],
        precision: Precision,
    ) -> Result<Vec<SpeechSegment>, ModelError> {
        self.check(precision)?;
        let loud = |s: &f32| s.abs() > 0.01;
        let first = samples.iter().position(loud);
        let last = samples.iter().rposition(loud);
        let (Some(first), Some(last)) = (first, last) else {
            return Ok(Vec::new());
        };
        Ok(vec![SpeechSegment {
            start_s: first as f64 / 16_000.0,
            end_s: (last + 1) as f64 / 16_000.0,
        }])
    }
}

impl LanguageIdentifier for FakeModel {
    fn identify(&self, _samples: &[f32], precision: Precision)
        -> Result<LanguageGuess, ModelError> {
        self.check(precision)?;
        Ok(self.language.clone())
    }
}

impl Transcriber for FakeModel {
    fn transcribe(&self, _samples: &[f32], precision: Precision) -> Result<Transcript, ModelError> {
        self.check(precision)?;
        Ok(self.transcript.clone())
    }
}

impl PunctuationRestorer for FakeModel {
    fn restore(&self, text: &str, precision: Precision) -> Result<String, ModelError> {
        self.check(precision)?;
        let text = text.trim();
        if text.is_empty() {
            return Ok(String::new());
        }
        let mut chars = text.chars();
        let mut restored: String =
            chars.next().into_iter().flat_map(char::to_uppercase).chain(chars).collect();
        if !restored.ends_with(['.', '?', '!']) {
            restored.push('.');
        }
        Ok(restored)
    }
}
