//! Pull-based, resource-aware scheduling of pending work orders.
//!
//! The scheduler owns a mutex-guarded deque of PENDING work orders and
//! claims at most one per stagger interval, driven by a background
//! poll loop plus `slot-available` wakeups from the event bus. A claim
//! only happens when the resource monitor hands out a slot and the
//! order's state machine accepts CLAIM; the bound execution handler
//! then owns the slot for the duration of the run.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;
use crate::events::{EngineEvent, EventBus};
use crate::order::WorkOrder;
use crate::resource::{PressureLevel, ResourceMonitor, Slot};
use crate::state::StateStore;
use tokio_util::sync::CancellationToken;

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Poll interval for claim attempts, in milliseconds.
    pub poll_interval_ms: u64,
    /// Minimum delay between two claims, in milliseconds.
    pub stagger_delay_ms: u64,
    /// Enqueue rejection threshold. 0 means unlimited.
    pub max_queue_depth: usize,
    /// Sort the queue by descending priority (stable) on insert.
    pub priority_enabled: bool,
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stagger_delay(&self) -> Duration {
        Duration::from_millis(self.stagger_delay_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
            stagger_delay_ms: 1_000,
            max_queue_depth: 0,
            priority_enabled: false,
        }
    }
}

/// Receives claimed work orders. The handler owns the slot until the
/// run terminates.
#[async_trait]
pub trait ExecutionHandler: Send + Sync {
    async fn execute(&self, order: WorkOrder, slot: Slot);
}

const _: () = {
    fn _assert_object_safe(_: &dyn ExecutionHandler) {}
};

/// Why a claim attempt ended without spawning work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimAttempt {
    /// A work order was claimed and handed to the handler.
    Claimed,
    QueueEmpty,
    NoHandler,
    Staggered,
    MemoryCritical,
    NoSlot,
    /// The order's state machine rejected CLAIM; it was pushed back.
    Rejected,
}

struct QueueState {
    deque: VecDeque<WorkOrder>,
    last_claim: Option<Instant>,
}

/// The pull-based scheduler.
pub struct Scheduler {
    cfg: SchedulerConfig,
    queue: Mutex<QueueState>,
    bus: EventBus,
    monitor: Arc<ResourceMonitor>,
    states: Arc<StateStore>,
    handler: Mutex<Option<Arc<dyn ExecutionHandler>>>,
}

impl Scheduler {
    pub fn new(
        cfg: SchedulerConfig,
        bus: EventBus,
        monitor: Arc<ResourceMonitor>,
        states: Arc<StateStore>,
    ) -> Self {
        Self {
            cfg,
            queue: Mutex::new(QueueState {
                deque: VecDeque::new(),
                last_claim: None,
            }),
            bus,
            monitor,
            states,
            handler: Mutex::new(None),
        }
    }

    /// Bind the execution handler. Claims are skipped until one is set.
    pub fn set_handler(&self, handler: Arc<dyn ExecutionHandler>) {
        *self.handler.lock().expect("scheduler handler poisoned") = Some(handler);
    }

    pub fn depth(&self) -> usize {
        self.queue.lock().expect("scheduler queue poisoned").deque.len()
    }

    /// Add a PENDING work order to the queue.
    ///
    /// Rejects with backpressure when the queue is at capacity; the
    /// queue is left untouched. With priority scheduling enabled the
    /// order is inserted after all orders of greater or equal priority,
    /// so equal priorities stay FIFO.
    pub fn enqueue(&self, order: WorkOrder) -> Result<(), EngineError> {
        let mut queue = self.queue.lock().expect("scheduler queue poisoned");
        if self.cfg.max_queue_depth > 0 && queue.deque.len() >= self.cfg.max_queue_depth {
            let depth = queue.deque.len();
            drop(queue);
            tracing::warn!(work_order_id = %order.id, depth, "enqueue rejected: backpressure");
            self.bus.emit(EngineEvent::Backpressure { depth });
            return Err(EngineError::Backpressure { depth });
        }

        if self.cfg.priority_enabled {
            let position = queue
                .deque
                .iter()
                .position(|queued| queued.priority < order.priority)
                .unwrap_or(queue.deque.len());
            queue.deque.insert(position, order);
        } else {
            queue.deque.push_back(order);
        }
        Ok(())
    }

    /// Remove a queued order (used when it is cancelled while pending).
    pub fn remove(&self, work_order_id: Uuid) -> Option<WorkOrder> {
        let mut queue = self.queue.lock().expect("scheduler queue poisoned");
        let position = queue.deque.iter().position(|o| o.id == work_order_id)?;
        queue.deque.remove(position)
    }

    /// One claim attempt.
    ///
    /// Order of checks: empty queue, handler bound, stagger window,
    /// memory pressure, slot acquisition, CLAIM transition. At most one
    /// order is claimed per call, and at most one per stagger interval.
    pub fn try_claim(&self) -> ClaimAttempt {
        let mut queue = self.queue.lock().expect("scheduler queue poisoned");

        if queue.deque.is_empty() {
            self.bus.emit(EngineEvent::QueueEmpty);
            return ClaimAttempt::QueueEmpty;
        }

        let handler = {
            let handler = self.handler.lock().expect("scheduler handler poisoned");
            match handler.as_ref() {
                Some(handler) => Arc::clone(handler),
                None => {
                    tracing::warn!("claim skipped: no execution handler bound");
                    return ClaimAttempt::NoHandler;
                }
            }
        };

        if let Some(last) = queue.last_claim {
            let since = last.elapsed();
            if since < self.cfg.stagger_delay() {
                let remaining = self.cfg.stagger_delay() - since;
                let front_id = queue.deque.front().map(|o| o.id).unwrap_or_default();
                self.bus.emit(EngineEvent::StaggerWait {
                    work_order_id: front_id,
                    remaining_ms: remaining.as_millis() as u64,
                });
                return ClaimAttempt::Staggered;
            }
        }

        if self.monitor.pressure() == PressureLevel::Critical {
            return ClaimAttempt::MemoryCritical;
        }

        let front_id = queue.deque.front().expect("checked non-empty").id;
        let Some(slot) = self.monitor.acquire_slot(front_id) else {
            return ClaimAttempt::NoSlot;
        };

        let order = queue.deque.pop_front().expect("checked non-empty");
        queue.last_claim = Some(Instant::now());
        drop(queue);

        // The slot is only handed over if the state machine accepts
        // CLAIM; otherwise the order goes back to the front.
        let claim = match self.states.get(order.id) {
            Some(record) => record
                .lock()
                .expect("state record poisoned")
                .claim(slot.id),
            None => Err(EngineError::UnknownOrder(order.id)),
        };
        if let Err(e) = claim {
            tracing::error!(work_order_id = %order.id, error = %e, "claim transition rejected");
            self.monitor.release_slot(&slot);
            let mut queue = self.queue.lock().expect("scheduler queue poisoned");
            queue.deque.push_front(order);
            return ClaimAttempt::Rejected;
        }

        self.bus.emit(EngineEvent::WorkClaimed {
            work_order_id: order.id,
            slot_id: slot.id,
        });
        tracing::info!(work_order_id = %order.id, slot_id = %slot.id, "work claimed");

        tokio::spawn(async move {
            handler.execute(order, slot).await;
        });
        ClaimAttempt::Claimed
    }

    /// Spawn the claim loop: a poll ticker plus `slot-available`
    /// wakeups. Stops when `cancel` fires.
    pub fn spawn_poller(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let scheduler = Arc::clone(self);
        let mut events = self.bus.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.cfg.poll_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        scheduler.try_claim();
                    }
                    event = events.recv() => {
                        match event {
                            Ok(EngineEvent::SlotAvailable { .. }) => {
                                scheduler.try_claim();
                            }
                            Ok(_) => {}
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                                tracing::debug!(skipped, "scheduler lagged on event bus");
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }
}
