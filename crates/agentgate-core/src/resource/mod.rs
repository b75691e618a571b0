//! Concurrency slots and memory pressure.
//!
//! The resource monitor owns a bounded pool of execution slots and a
//! periodically sampled memory gauge. Everything lives behind one mutex
//! so slot accounting and the pressure level are always consistent;
//! readers take a snapshot without blocking the sampler.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::events::{EngineEvent, EventBus};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Memory pressure level derived from the used/total ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureLevel {
    Ok,
    Warning,
    Critical,
}

impl fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ok => "ok",
            Self::Warning => "warning",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// An exclusive concurrency handle. Minted by [`ResourceMonitor::acquire_slot`],
/// returned through [`ResourceMonitor::release_slot`].
#[derive(Debug, Clone)]
pub struct Slot {
    pub id: Uuid,
    pub owner: Uuid,
    pub acquired_at: DateTime<Utc>,
}

/// One memory reading, in bytes.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MemorySample {
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub total_bytes: u64,
}

impl MemorySample {
    pub fn used_ratio(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.used_bytes as f64 / self.total_bytes as f64
    }
}

/// Source of memory readings. The production probe wraps `sysinfo`;
/// tests inject a scripted one.
pub trait MemoryProbe: Send + Sync {
    fn sample(&self) -> MemorySample;
}

/// Probe backed by `sysinfo`.
pub struct SysinfoProbe {
    system: Mutex<sysinfo::System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(sysinfo::System::new()),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SysinfoProbe {
    fn sample(&self) -> MemorySample {
        let mut system = self.system.lock().expect("sysinfo probe poisoned");
        system.refresh_memory();
        MemorySample {
            used_bytes: system.used_memory(),
            available_bytes: system.available_memory(),
            total_bytes: system.total_memory(),
        }
    }
}

/// Monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Slot pool size. `None` means one slot per logical core.
    pub max_slots: Option<usize>,
    /// Memory sampling interval in milliseconds.
    pub sample_interval_ms: u64,
    /// Used/total ratio above which pressure is `warning`.
    pub memory_warning_ratio: f64,
    /// Used/total ratio above which pressure is `critical`.
    pub memory_critical_ratio: f64,
}

impl ResourceConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn effective_slots(&self) -> usize {
        self.max_slots.unwrap_or_else(num_cpus::get).max(1)
    }
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            max_slots: None,
            sample_interval_ms: 5_000,
            memory_warning_ratio: 0.8,
            memory_critical_ratio: 0.9,
        }
    }
}

/// Point-in-time view for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceSnapshot {
    pub slots_total: usize,
    pub slots_in_use: usize,
    pub slots_free: usize,
    pub memory: MemorySample,
    pub pressure: PressureLevel,
}

// ---------------------------------------------------------------------------
// ResourceMonitor
// ---------------------------------------------------------------------------

struct Inner {
    capacity: usize,
    /// slot id -> owning work order.
    in_use: std::collections::HashMap<Uuid, Uuid>,
    pressure: PressureLevel,
    memory: MemorySample,
}

/// Slot pool plus memory gauge.
pub struct ResourceMonitor {
    inner: Mutex<Inner>,
    probe: Box<dyn MemoryProbe>,
    cfg: ResourceConfig,
    bus: EventBus,
}

impl ResourceMonitor {
    pub fn new(cfg: ResourceConfig, bus: EventBus) -> Self {
        Self::with_probe(cfg, bus, Box::new(SysinfoProbe::new()))
    }

    pub fn with_probe(cfg: ResourceConfig, bus: EventBus, probe: Box<dyn MemoryProbe>) -> Self {
        let capacity = cfg.effective_slots();
        Self {
            inner: Mutex::new(Inner {
                capacity,
                in_use: std::collections::HashMap::new(),
                pressure: PressureLevel::Ok,
                memory: MemorySample::default(),
            }),
            probe,
            cfg,
            bus,
        }
    }

    /// Try to mint a slot for `owner`.
    ///
    /// Returns `None` when the pool is exhausted, when memory pressure
    /// is critical, or when the owner already holds a slot (a work
    /// order occupies at most one).
    pub fn acquire_slot(&self, owner: Uuid) -> Option<Slot> {
        let mut inner = self.inner.lock().expect("resource monitor poisoned");
        if inner.pressure == PressureLevel::Critical {
            tracing::debug!(%owner, "slot refused: memory pressure critical");
            return None;
        }
        if inner.in_use.len() >= inner.capacity {
            return None;
        }
        if inner.in_use.values().any(|held_by| *held_by == owner) {
            tracing::warn!(%owner, "slot refused: owner already holds a slot");
            return None;
        }

        let slot = Slot {
            id: Uuid::new_v4(),
            owner,
            acquired_at: Utc::now(),
        };
        inner.in_use.insert(slot.id, owner);
        Some(slot)
    }

    /// Return a slot to the pool.
    ///
    /// Idempotent: the first release frees the slot and emits
    /// `slot-available`; later releases of the same slot are no-ops.
    pub fn release_slot(&self, slot: &Slot) {
        let released = {
            let mut inner = self.inner.lock().expect("resource monitor poisoned");
            inner.in_use.remove(&slot.id).is_some()
        };
        if released {
            self.bus.emit(EngineEvent::SlotAvailable { slot_id: slot.id });
        }
    }

    pub fn pressure(&self) -> PressureLevel {
        self.inner.lock().expect("resource monitor poisoned").pressure
    }

    pub fn snapshot(&self) -> ResourceSnapshot {
        let inner = self.inner.lock().expect("resource monitor poisoned");
        ResourceSnapshot {
            slots_total: inner.capacity,
            slots_in_use: inner.in_use.len(),
            slots_free: inner.capacity - inner.in_use.len(),
            memory: inner.memory,
            pressure: inner.pressure,
        }
    }

    /// Take one memory reading and update the pressure level.
    ///
    /// `memory-pressure` is emitted on level transitions only.
    pub fn sample_memory(&self) {
        let sample = self.probe.sample();
        let level = self.classify(sample);

        let changed = {
            let mut inner = self.inner.lock().expect("resource monitor poisoned");
            inner.memory = sample;
            let changed = inner.pressure != level;
            inner.pressure = level;
            changed
        };

        if changed {
            tracing::info!(%level, used_ratio = sample.used_ratio(), "memory pressure changed");
            self.bus.emit(EngineEvent::MemoryPressure { level });
        }
    }

    fn classify(&self, sample: MemorySample) -> PressureLevel {
        let ratio = sample.used_ratio();
        if ratio >= self.cfg.memory_critical_ratio {
            PressureLevel::Critical
        } else if ratio >= self.cfg.memory_warning_ratio {
            PressureLevel::Warning
        } else {
            PressureLevel::Ok
        }
    }

    /// Spawn the periodic sampler. Stops when `cancel` fires.
    pub fn spawn_sampler(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let monitor = Arc::clone(self);
        let interval = self.cfg.sample_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => monitor.sample_memory(),
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }
}
