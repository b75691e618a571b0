//! Observability sidecars fed from the event bus.
//!
//! Neither tap is consulted by the engine; they subscribe like any
//! other consumer and fold the stream into counters (metrics) and an
//! append-only transition log (audit). Audit persistence beyond this
//! in-memory window is a higher layer's concern.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::engine::RunResult;
use crate::events::{EngineEvent, EventBus};
use crate::state::{OrderEvent, OrderState};

// ---------------------------------------------------------------------------
// Metrics tap
// ---------------------------------------------------------------------------

/// Counter snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub runs_started: u64,
    pub runs_by_result: HashMap<String, u64>,
    pub iterations_total: u64,
    pub iterations_succeeded: u64,
    pub work_claimed: u64,
    pub backpressure_rejections: u64,
    pub retries_scheduled: u64,
}

/// Aggregates engine events into counters.
pub struct MetricsTap {
    counters: Mutex<MetricsSnapshot>,
}

impl MetricsTap {
    /// Subscribe to the bus and start counting. Stops when `cancel`
    /// fires.
    pub fn spawn(
        bus: &EventBus,
        cancel: CancellationToken,
    ) -> (Arc<Self>, tokio::task::JoinHandle<()>) {
        let tap = Arc::new(Self {
            counters: Mutex::new(MetricsSnapshot::default()),
        });
        let mut stream = bus.stream();
        let worker = Arc::clone(&tap);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    item = stream.next() => match item {
                        Some(Ok(event)) => worker.record(&event),
                        Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                            tracing::debug!(skipped, "metrics tap lagged on event bus");
                        }
                        None => break,
                    },
                    _ = cancel.cancelled() => break,
                }
            }
        });
        (tap, handle)
    }

    fn record(&self, event: &EngineEvent) {
        let mut c = self.counters.lock().expect("metrics counters poisoned");
        match event {
            EngineEvent::RunStarted { .. } => c.runs_started += 1,
            EngineEvent::RunCompleted { result, .. }
            | EngineEvent::RunFailed { result, .. } => {
                *c.runs_by_result.entry(result.to_string()).or_insert(0) += 1;
            }
            EngineEvent::RunCanceled { .. } => {
                *c.runs_by_result
                    .entry(RunResult::Cancelled.to_string())
                    .or_insert(0) += 1;
            }
            EngineEvent::IterationCompleted { success, .. } => {
                c.iterations_total += 1;
                if *success {
                    c.iterations_succeeded += 1;
                }
            }
            EngineEvent::WorkClaimed { .. } => c.work_claimed += 1,
            EngineEvent::Backpressure { .. } => c.backpressure_rejections += 1,
            EngineEvent::StateChanged {
                to: OrderState::WaitingRetry,
                ..
            } => c.retries_scheduled += 1,
            _ => {}
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.counters.lock().expect("metrics counters poisoned").clone()
    }
}

// ---------------------------------------------------------------------------
// Audit tap
// ---------------------------------------------------------------------------

/// One audited state transition.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub work_order_id: Uuid,
    pub from: OrderState,
    pub to: OrderState,
    pub event: OrderEvent,
    pub metadata: serde_json::Value,
    pub at: DateTime<Utc>,
}

/// Entries kept in memory before the oldest are dropped.
const AUDIT_WINDOW: usize = 10_000;

/// Collects the state-changed stream into an in-memory audit log.
pub struct AuditTap {
    entries: Mutex<Vec<AuditEntry>>,
}

impl AuditTap {
    pub fn spawn(
        bus: &EventBus,
        cancel: CancellationToken,
    ) -> (Arc<Self>, tokio::task::JoinHandle<()>) {
        let tap = Arc::new(Self {
            entries: Mutex::new(Vec::new()),
        });
        let mut stream = bus.stream();
        let worker = Arc::clone(&tap);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    item = stream.next() => match item {
                        Some(Ok(EngineEvent::StateChanged {
                            work_order_id,
                            from,
                            to,
                            event,
                            metadata,
                            at,
                        })) => worker.append(AuditEntry {
                            work_order_id,
                            from,
                            to,
                            event,
                            metadata,
                            at,
                        }),
                        Some(Ok(_)) => {}
                        Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                            tracing::warn!(skipped, "audit tap lagged, transitions lost");
                        }
                        None => break,
                    },
                    _ = cancel.cancelled() => break,
                }
            }
        });
        (tap, handle)
    }

    fn append(&self, entry: AuditEntry) {
        let mut entries = self.entries.lock().expect("audit entries poisoned");
        if entries.len() >= AUDIT_WINDOW {
            entries.remove(0);
        }
        entries.push(entry);
    }

    /// All entries for one work order, in transition order.
    pub fn for_order(&self, work_order_id: Uuid) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .expect("audit entries poisoned")
            .iter()
            .filter(|e| e.work_order_id == work_order_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("audit entries poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Poll until `check` passes or a second elapses.
    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 1s");
    }

    #[tokio::test]
    async fn metrics_tap_counts_events() {
        let bus = EventBus::default();
        let cancel = CancellationToken::new();
        let (tap, handle) = MetricsTap::spawn(&bus, cancel.clone());

        let run_id = Uuid::new_v4();
        bus.emit(EngineEvent::RunStarted {
            run_id,
            work_order_id: Uuid::new_v4(),
        });
        bus.emit(EngineEvent::IterationCompleted {
            run_id,
            iteration: 1,
            success: true,
        });
        bus.emit(EngineEvent::RunCompleted {
            run_id,
            work_order_id: Uuid::new_v4(),
            result: RunResult::Passed,
        });

        eventually(|| tap.snapshot().runs_by_result.contains_key("passed")).await;

        let snap = tap.snapshot();
        assert_eq!(snap.runs_started, 1);
        assert_eq!(snap.iterations_total, 1);
        assert_eq!(snap.iterations_succeeded, 1);
        assert_eq!(snap.runs_by_result.get("passed"), Some(&1));

        cancel.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn audit_tap_records_transitions_in_order() {
        let bus = EventBus::default();
        let cancel = CancellationToken::new();
        let (tap, handle) = AuditTap::spawn(&bus, cancel.clone());

        let id = Uuid::new_v4();
        let mut record = crate::state::StateRecord::new(id, 3, bus.clone());
        record.claim(Uuid::new_v4()).unwrap();
        record.ready().unwrap();

        eventually(|| tap.for_order(id).len() == 2).await;

        let entries = tap.for_order(id);
        assert_eq!(entries[0].to, OrderState::Preparing);
        assert_eq!(entries[1].to, OrderState::Running);

        cancel.cancel();
        let _ = handle.await;
    }
}
