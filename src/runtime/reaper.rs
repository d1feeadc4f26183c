//! # TTL Reaper
//!
//! Background task that unloads models nobody has used for longer than the
//! configured TTL, returning accelerator memory between bursts of traffic.
//!
//! ## Rules:
//! - Only Ready, unpinned slots idle for longer than the TTL are touched
//! - The slot guard is tried, never awaited, so a busy slot is simply skipped
//! - Release failures are logged and the slot still ends Unloaded

use crate::runtime::kind::ModelKind;
use crate::runtime::registry::ModelRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

pub struct TtlReaper {
    registry: Arc<ModelRegistry>,
    ttl: Duration,
    interval: Duration,
}

impl TtlReaper {
    pub fn new(registry: Arc<ModelRegistry>, ttl: Duration, interval: Duration) -> Self {
        Self { registry, ttl, interval }
    }

    /// Sweep interval for a TTL: a third of it, kept within 10..=60 seconds.
    pub fn interval_for(ttl: Duration) -> Duration {
        (ttl / 3).clamp(Duration::from_secs(10), Duration::from_secs(60))
    }

    /// A zero TTL disables eviction entirely.
    pub fn is_enabled(&self) -> bool {
        !self.ttl.is_zero()
    }

    /// Run one sweep and return the kinds that were unloaded.
    pub fn reap_once(&self) -> Vec<ModelKind> {
        ModelKind::ALL
            .iter()
            .copied()
            .filter(|&kind| self.registry.evict_if_idle(kind, self.ttl).is_some())
            .collect()
    }

    /// Sweep every `interval` until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if !self.is_enabled() {
            info!("Model TTL is zero, idle eviction disabled");
            return;
        }

        info!(
            ttl_secs = self.ttl.as_secs(),
            interval_secs = self.interval.as_secs(),
            "Idle model reaper started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let evicted = self.reap_once();
                    if !evicted.is_empty() {
                        debug!(count = evicted.len(), "Reaper sweep evicted models");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Idle model reaper stopped");
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::clock::ManualClock;
    use crate::runtime::precision::PrecisionSettings;
    use crate::runtime::slot::SlotStatus;
    use crate::runtime::testing::{FakeLoader, FakeWeights};
    use std::sync::atomic::Ordering;

    const TTL: Duration = Duration::from_secs(300);

    fn setup() -> (Arc<ModelRegistry>, Arc<ManualClock>, Arc<FakeLoader>) {
        let clock = Arc::new(ManualClock::new());
        let loader = Arc::new(FakeLoader::new());
        let registry = Arc::new(ModelRegistry::new(
            loader.clone(),
            Arc::new(FakeWeights::new()),
            clock.clone(),
            |_| PrecisionSettings::default(),
        ));
        (registry, clock, loader)
    }

    #[test]
    fn test_interval_for_ttl() {
        assert_eq!(TtlReaper::interval_for(Duration::from_secs(300)), Duration::from_secs(60));
        assert_eq!(TtlReaper::interval_for(Duration::from_secs(90)), Duration::from_secs(30));
        assert_eq!(TtlReaper::interval_for(Duration::from_secs(6)), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_idle_slot_past_ttl_is_evicted() {
        let (registry, clock, loader) = setup();
        drop(registry.acquire(ModelKind::Asr).await.unwrap());
        let reaper = TtlReaper::new(Arc::clone(&registry), TTL, TtlReaper::interval_for(TTL));

        clock.advance(TTL + Duration::from_secs(1));
        assert_eq!(reaper.reap_once(), vec![ModelKind::Asr]);

        assert_eq!(registry.snapshot(ModelKind::Asr).status, SlotStatus::Unloaded);
        assert_eq!(loader.counters.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recently_used_slot_is_kept() {
        let (registry, clock, _loader) = setup();
        drop(registry.acquire(ModelKind::Lid).await.unwrap());
        let reaper = TtlReaper::new(Arc::clone(&registry), TTL, TtlReaper::interval_for(TTL));

        clock.advance(TTL - Duration::from_secs(1));
        assert!(reaper.reap_once().is_empty());
        assert_eq!(registry.snapshot(ModelKind::Lid).status, SlotStatus::Ready);
    }

    #[tokio::test]
    async fn test_pinned_slot_is_never_evicted() {
        let (registry, clock, _loader) = setup();
        let handle = registry.acquire(ModelKind::Vad).await.unwrap();
        let reaper = TtlReaper::new(Arc::clone(&registry), TTL, TtlReaper::interval_for(TTL));

        clock.advance(TTL * 10);
        assert!(reaper.reap_once().is_empty());
        assert_eq!(registry.snapshot(ModelKind::Vad).status, SlotStatus::Ready);

        drop(handle);
        assert_eq!(reaper.reap_once(), vec![ModelKind::Vad]);
    }

    #[tokio::test]
    async fn test_evicted_slot_reloads_on_next_acquire() {
        let (registry, clock, loader) = setup();
        drop(registry.acquire(ModelKind::Punc).await.unwrap());
        let reaper = TtlReaper::new(Arc::clone(&registry), TTL, TtlReaper::interval_for(TTL));

        clock.advance(TTL * 2);
        reaper.reap_once();
        drop(registry.acquire(ModelKind::Punc).await.unwrap());

        assert_eq!(loader.counters.loads(ModelKind::Punc), 2);
        assert_eq!(registry.snapshot(ModelKind::Punc).load_count, 2);
    }

    #[tokio::test]
    async fn test_zero_ttl_run_returns_immediately() {
        let (registry, _clock, _loader) = setup();
        let (_tx, rx) = watch::channel(false);
        let reaper = TtlReaper::new(registry, Duration::ZERO, Duration::from_secs(10));

        assert!(!reaper.is_enabled());
        reaper.run(rx).await;
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_signal() {
        let (registry, _clock, _loader) = setup();
        let (tx, rx) = watch::channel(false);
        let task = TtlReaper::new(registry, TTL, Duration::from_millis(10)).spawn(rx);

        tx.send(true).unwrap();
        task.await.unwrap();
    }
}
