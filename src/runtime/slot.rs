//! # Model Slots
//!
//! A slot holds the single instance of one model kind and everything the
//! registry and reaper need to know about it.
//!
//! ## State Transitions:
//! Unloaded → Loading → Ready → Unloading → Unloaded
//! A failed load goes Loading → Unloaded.
//!
//! ## Locking:
//! - `state` (tokio mutex) is the per-slot guard. Every transition and every
//!   inference happens while holding it.
//! - `snapshot` (std rwlock) mirrors the observable fields so status reads
//!   and the reaper's pre-check never wait behind a running inference.
//! - `pins` counts callers between the start of `acquire` and handle release.

use crate::runtime::backend::{LoadedModel, ModelCapabilities};
use crate::runtime::error::ModelError;
use crate::runtime::kind::ModelKind;
use crate::runtime::precision::{PrecisionPolicy, PrecisionSettings};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::Mutex;

/// Lifecycle status of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotStatus {
    /// No instance resident
    Unloaded,
    /// Weights being fetched or the model being initialized
    Loading,
    /// Instance resident and usable
    Ready,
    /// Instance being released
    Unloading,
}

impl std::fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SlotStatus::Unloaded => "unloaded",
            SlotStatus::Loading => "loading",
            SlotStatus::Ready => "ready",
            SlotStatus::Unloading => "unloading",
        };
        write!(f, "{}", name)
    }
}

/// State guarded by the per-slot mutex.
#[derive(Debug)]
pub struct SlotState {
    /// Present iff the slot is Ready.
    pub(crate) instance: Option<Arc<LoadedModel>>,
    pub(crate) policy: Option<PrecisionPolicy>,
    /// Last failed attempt id with its error, handed to waiters of that attempt.
    pub(crate) last_failure: Option<(u64, ModelError)>,
}

/// Lock-free view of a slot for status reads.
#[derive(Debug, Clone)]
pub struct SlotSnapshot {
    pub status: SlotStatus,
    pub last_used_at: Option<Instant>,
    pub policy: Option<PrecisionPolicy>,
    /// Id of the most recent load attempt.
    pub load_attempt: u64,
    /// Number of successful loads since start.
    pub load_count: u64,
}

impl SlotSnapshot {
    /// Id of the load currently in progress, if any.
    pub fn in_flight_attempt(&self) -> Option<u64> {
        (self.status == SlotStatus::Loading).then_some(self.load_attempt)
    }
}

#[derive(Debug)]
pub struct ModelSlot {
    kind: ModelKind,
    capabilities: ModelCapabilities,
    settings: PrecisionSettings,
    pub(crate) state: Arc<Mutex<SlotState>>,
    snapshot: RwLock<SlotSnapshot>,
    pins: AtomicUsize,
}

impl ModelSlot {
    pub fn new(
        kind: ModelKind,
        capabilities: ModelCapabilities,
        settings: PrecisionSettings,
    ) -> Self {
        Self {
            kind,
            capabilities,
            settings,
            state: Arc::new(Mutex::new(SlotState {
                instance: None,
                policy: None,
                last_failure: None,
            })),
            snapshot: RwLock::new(SlotSnapshot {
                status: SlotStatus::Unloaded,
                last_used_at: None,
                policy: None,
                load_attempt: 0,
                load_count: 0,
            }),
            pins: AtomicUsize::new(0),
        }
    }

    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    pub fn capabilities(&self) -> ModelCapabilities {
        self.capabilities
    }

    pub fn settings(&self) -> PrecisionSettings {
        self.settings
    }

    pub fn pins(&self) -> usize {
        self.pins.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> SlotSnapshot {
        self.snapshot.read().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    pub(crate) fn update<F: FnOnce(&mut SlotSnapshot)>(&self, change: F) {
        let mut snapshot = self.snapshot.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        change(&mut snapshot);
    }

    /// Enter Loading and return the new attempt id.
    pub(crate) fn begin_loading(&self) -> u64 {
        let mut attempt = 0;
        self.update(|s| {
            s.status = SlotStatus::Loading;
            s.load_attempt += 1;
            attempt = s.load_attempt;
        });
        attempt
    }
}

/// Keeps a slot out of the reaper's reach while alive.
#[derive(Debug)]
pub struct SlotPin {
    slot: Arc<ModelSlot>,
}

impl SlotPin {
    pub fn new(slot: Arc<ModelSlot>) -> Self {
        slot.pins.fetch_add(1, Ordering::SeqCst);
        Self { slot }
    }
}

impl Drop for SlotPin {
    fn drop(&mut self) {
        self.slot.pins.fetch_sub(1, Ordering::SeqCst);
    }
}
