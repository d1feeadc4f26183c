//! # Model Registry
//!
//! Owns one slot per model kind and is the only way request code reaches a
//! model instance.
//!
//! ## Key Features:
//! - **Lazy single-flight loading**: the first `acquire` loads; concurrent
//!   callers queue on the slot guard and share that one load attempt
//! - **Pinning**: a slot is pinned from the start of `acquire` until its
//!   [`ModelHandle`] is dropped, and pinned slots are never evicted
//! - **Precision policy**: inference goes through [`run_with_fallback`]
//! - **Compute gate**: one inference at a time across all kinds
//! - **Status without side effects**: `status()` never loads anything
//!
//! ## Thread Safety:
//! The registry is shared as `Arc<ModelRegistry>`. Slot guards are tokio
//! mutexes, so waiting for a load parks the task instead of spinning.

use crate::runtime::backend::{LoadedModel, ModelLoader, WeightStore};
use crate::runtime::clock::Clock;
use crate::runtime::error::ModelError;
use crate::runtime::kind::ModelKind;
use crate::runtime::precision::{run_with_fallback, Precision, PrecisionPolicy, PrecisionSettings};
use crate::runtime::slot::{ModelSlot, SlotPin, SlotSnapshot, SlotState, SlotStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedMutexGuard, Semaphore};
use tracing::{debug, error, info, warn};

/// Per-kind status entry reported by `/v1/models/status`.
#[derive(Debug, Clone, Serialize)]
pub struct SlotReport {
    pub kind: ModelKind,
    pub status: SlotStatus,
    pub loaded: bool,
    /// Weights present on local disk
    pub downloaded: bool,
    pub last_used_at: Option<DateTime<Utc>>,
    pub idle_seconds: Option<f64>,
    /// Precision the next inference will start at (only when loaded)
    pub precision: Option<Precision>,
    pub use_half: bool,
    pub fallback_enabled: bool,
    pub precision_resolved: bool,
    pub supports_precision_toggle: bool,
    pub load_count: u64,
    pub pins: usize,
}

pub struct ModelRegistry {
    /// Indexed by [`ModelKind::index`].
    slots: Vec<Arc<ModelSlot>>,
    loader: Arc<dyn ModelLoader>,
    weights: Arc<dyn WeightStore>,
    clock: Arc<dyn Clock>,
    compute: Arc<Semaphore>,
}

impl ModelRegistry {
    /// Create a registry with every slot Unloaded.
    ///
    /// ## Parameters:
    /// - `loader`: builds instances; its capability descriptors are read once here
    /// - `weights`: weight provider used before every load
    /// - `clock`: time source for idle accounting
    /// - `precision`: configured precision settings per kind
    pub fn new(
        loader: Arc<dyn ModelLoader>,
        weights: Arc<dyn WeightStore>,
        clock: Arc<dyn Clock>,
        precision: impl Fn(ModelKind) -> PrecisionSettings,
    ) -> Self {
        let slots = ModelKind::ALL
            .iter()
            .map(|&kind| Arc::new(ModelSlot::new(kind, loader.capabilities(kind), precision(kind))))
            .collect();

        Self {
            slots,
            loader,
            weights,
            clock,
            compute: Arc::new(Semaphore::new(1)),
        }
    }

    fn slot(&self, kind: ModelKind) -> &Arc<ModelSlot> {
        &self.slots[kind.index()]
    }

    #[cfg(test)]
    pub fn snapshot(&self, kind: ModelKind) -> SlotSnapshot {
        self.slot(kind).snapshot()
    }

    /// Get a usable handle for `kind`, loading the model first if needed.
    ///
    /// Waits without a timeout while another caller loads. Callers that were
    /// waiting on a load attempt that failed receive that attempt's error.
    pub async fn acquire(&self, kind: ModelKind) -> Result<ModelHandle, ModelError> {
        let slot = Arc::clone(self.slot(kind));
        let pin = SlotPin::new(Arc::clone(&slot));
        let joined_attempt = slot.snapshot().in_flight_attempt();

        let mut state = Arc::clone(&slot.state).lock_owned().await;

        if state.instance.is_none() {
            let shared_failure = joined_attempt.zip(state.last_failure.as_ref());
            if let Some((joined, (failed, error))) = shared_failure {
                if joined == *failed {
                    debug!(
                        kind = %kind,
                        attempt = joined,
                        "Reporting shared load failure to waiter"
                    );
                    return Err(error.clone());
                }
            }
            state = self.load(Arc::clone(&slot), state).await?;
        }

        Ok(ModelHandle {
            slot,
            state,
            clock: Arc::clone(&self.clock),
            compute: Arc::clone(&self.compute),
            _pin: pin,
        })
    }

    /// Load into `slot` on a detached task that owns the slot guard.
    ///
    /// The task keeps the guard until the instance is published or the failure
    /// recorded, even when the caller is dropped, so later callers queue behind
    /// the running load instead of starting another.
    async fn load(
        &self,
        slot: Arc<ModelSlot>,
        state: OwnedMutexGuard<SlotState>,
    ) -> Result<OwnedMutexGuard<SlotState>, ModelError> {
        let kind = slot.kind();
        let context = LoadContext {
            loader: Arc::clone(&self.loader),
            weights: Arc::clone(&self.weights),
            clock: Arc::clone(&self.clock),
        };

        match tokio::spawn(context.load_slot(slot, state)).await {
            Ok((state, Ok(()))) => Ok(state),
            Ok((_, Err(error))) => Err(error),
            Err(e) => Err(ModelError::load(kind, format!("load task failed: {}", e))),
        }
    }

    /// Fetch weights for `kinds` without loading instances.
    ///
    /// Runs under each slot guard so it never overlaps a lazy load of the same kind.
    pub async fn prefetch(&self, kinds: &[ModelKind]) -> Result<(), ModelError> {
        for &kind in kinds {
            let _state = self.slot(kind).state.lock().await;
            if self.weights.is_present(kind) {
                debug!(kind = %kind, "Weights already cached");
                continue;
            }
            info!(kind = %kind, "Prefetching model weights");
            self.weights.fetch(kind).await?;
        }
        Ok(())
    }

    /// Unload `kind` if it is Ready, unpinned and idle for longer than `ttl`.
    ///
    /// Never waits: a busy slot guard means the slot is in use. Returns the
    /// idle time of an evicted slot.
    pub(crate) fn evict_if_idle(&self, kind: ModelKind, ttl: Duration) -> Option<Duration> {
        let slot = self.slot(kind);
        if !self.idle_past(slot, ttl) {
            return None;
        }

        let Ok(mut state) = slot.state.try_lock() else {
            debug!(kind = %kind, "Slot busy, skipping eviction");
            return None;
        };

        // State may have moved between the snapshot read and taking the guard.
        if state.instance.is_none() || !self.idle_past(slot, ttl) {
            return None;
        }

        let idle = self.idle_for(&slot.snapshot())?;
        self.release_locked(slot, &mut state);
        info!(kind = %kind, idle_secs = idle.as_secs_f64(), "Evicted idle model");
        Some(idle)
    }

    /// Unload every resident model, waiting for running inferences first.
    pub async fn unload_all(&self) {
        for slot in &self.slots {
            let mut state = slot.state.lock().await;
            let _gate = self.compute.acquire().await.ok();
            if state.instance.is_some() {
                self.release_locked(slot, &mut state);
                info!(kind = %slot.kind(), "Model unloaded on shutdown");
            }
        }
    }

    fn release_locked(&self, slot: &ModelSlot, state: &mut SlotState) {
        let Some(model) = state.instance.take() else {
            return;
        };
        let kind = slot.kind();
        slot.update(|s| s.status = SlotStatus::Unloading);

        if let Err(error) = self.loader.unload(kind, model) {
            warn!(kind = %kind, error = %error, "Model release failed, marking unloaded anyway");
        }

        state.policy = None;
        slot.update(|s| {
            s.status = SlotStatus::Unloaded;
            s.policy = None;
        });
    }

    fn idle_for(&self, snapshot: &SlotSnapshot) -> Option<Duration> {
        snapshot
            .last_used_at
            .map(|last| self.clock.now().saturating_duration_since(last))
    }

    fn idle_past(&self, slot: &ModelSlot, ttl: Duration) -> bool {
        let snapshot = slot.snapshot();
        snapshot.status == SlotStatus::Ready
            && slot.pins() == 0
            && self.idle_for(&snapshot).is_some_and(|idle| idle > ttl)
    }

    /// Report every slot. Never loads or downloads.
    pub fn status(&self) -> Vec<SlotReport> {
        self.slots.iter().map(|slot| self.report(slot)).collect()
    }

    fn report(&self, slot: &ModelSlot) -> SlotReport {
        let snapshot = slot.snapshot();
        let idle = self.idle_for(&snapshot);
        let settings = slot.settings();
        let loaded = snapshot.status == SlotStatus::Ready;

        let last_used_at = idle.map(|idle| {
            let idle =
                chrono::Duration::from_std(idle).unwrap_or_else(|_| chrono::Duration::zero());
            Utc::now() - idle
        });

        let (use_half, fallback_enabled, precision_resolved, precision) = match snapshot.policy {
            Some(policy) => (
                policy.use_half(),
                policy.fallback_enabled(),
                policy.is_resolved(),
                Some(policy.attempt()),
            ),
            None => (settings.use_half, settings.fallback_enabled, false, None),
        };

        SlotReport {
            kind: slot.kind(),
            status: snapshot.status,
            loaded,
            downloaded: self.weights.is_present(slot.kind()),
            last_used_at,
            idle_seconds: idle.map(|d| d.as_secs_f64()),
            precision,
            use_half,
            fallback_enabled,
            precision_resolved,
            supports_precision_toggle: slot.capabilities().supports_precision_toggle,
            load_count: snapshot.load_count,
            pins: slot.pins(),
        }
    }
}

/// The registry parts a detached load task needs.
struct LoadContext {
    loader: Arc<dyn ModelLoader>,
    weights: Arc<dyn WeightStore>,
    clock: Arc<dyn Clock>,
}

impl LoadContext {
    async fn load_slot(
        self,
        slot: Arc<ModelSlot>,
        mut state: OwnedMutexGuard<SlotState>,
    ) -> (OwnedMutexGuard<SlotState>, Result<(), ModelError>) {
        let kind = slot.kind();
        let attempt = slot.begin_loading();
        let mut reset = ResetOnAbort { slot: &slot, armed: true };
        let started = Instant::now();
        info!(kind = %kind, model = kind.description(), attempt, "Loading model");

        let outcome = self.fetch_and_build(&slot).await;
        reset.armed = false;

        let result = match outcome {
            Ok((model, policy)) => {
                let now = self.clock.now();
                state.instance = Some(Arc::new(model));
                state.policy = Some(policy);
                state.last_failure = None;
                slot.update(|s| {
                    s.status = SlotStatus::Ready;
                    s.last_used_at = Some(now);
                    s.policy = Some(policy);
                    s.load_count += 1;
                });
                info!(
                    kind = %kind,
                    precision = %policy.attempt(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Model ready"
                );
                Ok(())
            }
            Err(error) => {
                state.last_failure = Some((attempt, error.clone()));
                slot.update(|s| s.status = SlotStatus::Unloaded);
                error!(kind = %kind, attempt, error = %error, "Model load failed");
                Err(error)
            }
        };
        (state, result)
    }

    async fn fetch_and_build(
        &self,
        slot: &ModelSlot,
    ) -> Result<(LoadedModel, PrecisionPolicy), ModelError> {
        let kind = slot.kind();
        let weights = self.weights.fetch(kind).await?;
        let policy = PrecisionPolicy::resolve(kind, slot.settings(), slot.capabilities());
        let precision = policy.attempt();

        let loader = Arc::clone(&self.loader);
        let model = tokio::task::spawn_blocking(move || loader.load(kind, &weights, precision))
            .await
            .map_err(|e| ModelError::load(kind, format!("load task failed: {}", e)))??;

        if model.kind() != kind {
            return Err(ModelError::WrongKind { expected: kind, actual: model.kind() });
        }
        Ok((model, policy))
    }
}

/// Puts a slot back to Unloaded if its load task dies before publishing.
struct ResetOnAbort<'a> {
    slot: &'a ModelSlot,
    armed: bool,
}

impl Drop for ResetOnAbort<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!(kind = %self.slot.kind(), "Model load task aborted");
            self.slot.update(|s| s.status = SlotStatus::Unloaded);
        }
    }
}

/// Exclusive, pinned access to a Ready slot.
///
/// Holding the handle holds the slot guard, so requests for the same kind
/// queue behind it and the reaper skips it. Drop it to release.
pub struct ModelHandle {
    slot: Arc<ModelSlot>,
    state: OwnedMutexGuard<SlotState>,
    clock: Arc<dyn Clock>,
    compute: Arc<Semaphore>,
    _pin: SlotPin,
}

impl ModelHandle {
    pub fn kind(&self) -> ModelKind {
        self.slot.kind()
    }

    /// Run one inference under the slot's precision policy.
    ///
    /// `op` runs on a blocking thread behind the process-wide compute gate and
    /// is invoked a second time at full precision when a half-precision attempt
    /// fails numerically and fallback is enabled. `last_used_at` moves only
    /// after a successful run.
    pub async fn run<T, F>(&mut self, op: F) -> Result<T, ModelError>
    where
        T: Send + 'static,
        F: Fn(&LoadedModel, Precision) -> Result<T, ModelError> + Send + Sync + 'static,
    {
        let kind = self.kind();
        let model = self
            .state
            .instance
            .clone()
            .ok_or_else(|| {
                ModelError::inference(format!("{} slot has no resident instance", kind))
            })?;
        let mut policy = self
            .state
            .policy
            .ok_or_else(|| {
                ModelError::inference(format!("{} slot has no precision policy", kind))
            })?;

        let op = Arc::new(op);
        let compute = Arc::clone(&self.compute);
        let slot = Arc::clone(&self.slot);

        let result = run_with_fallback(&mut policy, kind, |precision| {
            let model = Arc::clone(&model);
            let op = Arc::clone(&op);
            let compute = Arc::clone(&compute);
            let pin = SlotPin::new(Arc::clone(&slot));
            async move {
                let permit = compute
                    .acquire_owned()
                    .await
                    .map_err(|_| ModelError::inference("compute gate closed"))?;
                // Instance, pin and permit are released only when the blocking
                // call returns, whether or not anyone still awaits it.
                tokio::task::spawn_blocking(move || {
                    let result = (*op)(&*model, precision);
                    drop((model, pin, permit));
                    result
                })
                .await
                .map_err(|e| ModelError::inference(format!("inference task failed: {}", e)))?
            }
        })
        .await;

        self.state.policy = Some(policy);
        let now = self.clock.now();
        let succeeded = result.is_ok();
        self.slot.update(|s| {
            s.policy = Some(policy);
            if succeeded {
                s.last_used_at = Some(now);
            }
        });

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::clock::ManualClock;
    use crate::runtime::testing::{FakeLoader, FakeWeights};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry(
        loader: Arc<FakeLoader>,
        weights: Arc<FakeWeights>,
        settings: PrecisionSettings,
    ) -> Arc<ModelRegistry> {
        let clock = Arc::new(ManualClock::new());
        Arc::new(ModelRegistry::new(loader, weights, clock, move |_| settings))
    }

    fn default_registry(loader: Arc<FakeLoader>) -> Arc<ModelRegistry> {
        registry(loader, Arc::new(FakeWeights::new()), PrecisionSettings::default())
    }

    fn transcribe(handle_model: &LoadedModel, precision: Precision) -> Result<String, ModelError> {
        Ok(handle_model.as_asr()?.transcribe(&[0.0; 160], precision)?.text)
    }

    #[tokio::test]
    async fn test_concurrent_acquire_loads_once() {
        let loader = Arc::new(FakeLoader::new().with_load_delay(Duration::from_millis(50)));
        let registry = default_registry(Arc::clone(&loader));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                let mut handle = registry.acquire(ModelKind::Asr).await?;
                handle.run(transcribe).await
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }

        assert_eq!(loader.counters.loads(ModelKind::Asr), 1);
        assert_eq!(registry.snapshot(ModelKind::Asr).load_count, 1);
        assert_eq!(registry.snapshot(ModelKind::Asr).status, SlotStatus::Ready);
    }

    #[tokio::test]
    async fn test_waiters_share_failed_attempt_and_next_request_retries() {
        let loader =
            Arc::new(FakeLoader::new().with_load_delay(Duration::from_millis(50)).failing_loads(1));
        let registry = default_registry(Arc::clone(&loader));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                registry.acquire(ModelKind::Lid).await.map(|_| ())
            }));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        for task in tasks {
            assert!(matches!(task.await.unwrap(), Err(ModelError::Load { .. })));
        }
        assert_eq!(loader.counters.loads(ModelKind::Lid), 1);
        assert_eq!(registry.snapshot(ModelKind::Lid).status, SlotStatus::Unloaded);

        assert!(registry.acquire(ModelKind::Lid).await.is_ok());
        assert_eq!(loader.counters.loads(ModelKind::Lid), 2);
    }

    #[tokio::test]
    async fn test_dropped_acquire_leaves_load_to_next_caller() {
        let loader = Arc::new(FakeLoader::new().with_load_delay(Duration::from_millis(300)));
        let registry = default_registry(Arc::clone(&loader));

        let first = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.acquire(ModelKind::Punc).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        first.abort();
        let _ = first.await;
        assert_eq!(registry.snapshot(ModelKind::Punc).status, SlotStatus::Loading);

        let handle = registry.acquire(ModelKind::Punc).await.unwrap();
        assert_eq!(handle.kind(), ModelKind::Punc);
        assert_eq!(loader.counters.loads(ModelKind::Punc), 1);
        assert_eq!(loader.counters.peak_loads.load(Ordering::SeqCst), 1);
        assert_eq!(registry.snapshot(ModelKind::Punc).load_count, 1);
    }

    #[tokio::test]
    async fn test_dropped_run_holds_compute_gate_and_pin_until_inference_ends() {
        let registry = default_registry(Arc::new(FakeLoader::new()));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let slow = {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            move |model: &LoadedModel, precision: Precision| {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(300));
                active.fetch_sub(1, Ordering::SeqCst);
                transcribe(model, precision)
            }
        };

        let first = {
            let registry = Arc::clone(&registry);
            let slow = slow.clone();
            tokio::spawn(async move {
                let mut handle = registry.acquire(ModelKind::Asr).await?;
                handle.run(slow).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        first.abort();
        let _ = first.await;

        assert_eq!(active.load(Ordering::SeqCst), 1);
        assert_eq!(registry.slot(ModelKind::Asr).pins(), 1);

        let mut handle = registry.acquire(ModelKind::Asr).await.unwrap();
        handle.run(slow).await.unwrap();
        drop(handle);

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(registry.slot(ModelKind::Asr).pins(), 0);
    }

    #[tokio::test]
    async fn test_download_failure_surfaces_and_is_not_cached() {
        let weights = Arc::new(FakeWeights::new());
        weights.offline.store(true, Ordering::SeqCst);
        let loader = Arc::new(FakeLoader::new());
        let registry =
            registry(Arc::clone(&loader), Arc::clone(&weights), PrecisionSettings::default());

        let result = registry.acquire(ModelKind::Asr).await;
        assert!(matches!(result, Err(ModelError::Download { .. })));
        assert_eq!(loader.counters.loads(ModelKind::Asr), 0);

        weights.offline.store(false, Ordering::SeqCst);
        assert!(registry.acquire(ModelKind::Asr).await.is_ok());
    }

    #[tokio::test]
    async fn test_fallback_pins_full_and_never_retries_half() {
        let loader = Arc::new(FakeLoader::new().with_precision_toggle().half_fails());
        let settings = PrecisionSettings { use_half: true, fallback_enabled: true };
        let registry = registry(Arc::clone(&loader), Arc::new(FakeWeights::new()), settings);

        for _ in 0..3 {
            let mut handle = registry.acquire(ModelKind::Asr).await.unwrap();
            assert!(handle.run(transcribe).await.is_ok());
        }

        assert_eq!(loader.counters.half_runs.load(Ordering::SeqCst), 1);
        assert_eq!(loader.counters.full_runs.load(Ordering::SeqCst), 3);

        let report = registry.status().into_iter().find(|r| r.kind == ModelKind::Asr).unwrap();
        assert!(report.precision_resolved);
        assert_eq!(report.precision, Some(Precision::Full));
    }

    #[tokio::test]
    async fn test_numeric_failure_without_fallback_propagates() {
        let loader = Arc::new(FakeLoader::new().with_precision_toggle().half_fails());
        let settings = PrecisionSettings { use_half: true, fallback_enabled: false };
        let registry = registry(Arc::clone(&loader), Arc::new(FakeWeights::new()), settings);

        let mut handle = registry.acquire(ModelKind::Asr).await.unwrap();
        let result = handle.run(transcribe).await;

        assert!(matches!(result, Err(ModelError::NumericFailure { .. })));
        assert_eq!(loader.counters.full_runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_status_never_loads() {
        let loader = Arc::new(FakeLoader::new());
        let registry = default_registry(Arc::clone(&loader));

        let reports = registry.status();
        assert_eq!(reports.len(), 4);
        assert!(reports.iter().all(|r| r.status == SlotStatus::Unloaded && !r.loaded));
        assert!(reports.iter().all(|r| r.last_used_at.is_none()));
        assert_eq!(loader.counters.total_loads(), 0);
    }

    #[tokio::test]
    async fn test_handle_pins_slot_until_dropped() {
        let registry = default_registry(Arc::new(FakeLoader::new()));

        let handle = registry.acquire(ModelKind::Vad).await.unwrap();
        assert_eq!(registry.slot(ModelKind::Vad).pins(), 1);
        drop(handle);
        assert_eq!(registry.slot(ModelKind::Vad).pins(), 0);
    }

    #[tokio::test]
    async fn test_unload_all_releases_instances() {
        let loader = Arc::new(FakeLoader::new());
        let registry = default_registry(Arc::clone(&loader));

        drop(registry.acquire(ModelKind::Asr).await.unwrap());
        drop(registry.acquire(ModelKind::Punc).await.unwrap());
        registry.unload_all().await;

        assert_eq!(loader.counters.releases.load(Ordering::SeqCst), 2);
        assert!(registry.status().iter().all(|r| r.status == SlotStatus::Unloaded));
    }

    #[tokio::test]
    async fn test_prefetch_downloads_missing_weights_only() {
        let weights = Arc::new(FakeWeights::new());
        let loader = Arc::new(FakeLoader::new());
        let registry =
            registry(Arc::clone(&loader), Arc::clone(&weights), PrecisionSettings::default());

        registry.prefetch(&ModelKind::ALL).await.unwrap();
        registry.prefetch(&ModelKind::ALL).await.unwrap();

        assert_eq!(weights.fetches.load(Ordering::SeqCst), 4);
        assert_eq!(loader.counters.total_loads(), 0);
    }
}
