//! The in-process event bus.
//!
//! Every component publishes structured [`EngineEvent`]s here instead of
//! holding references to its consumers; the scheduler, the observability
//! taps, and the API layer all subscribe independently. Slow subscribers
//! lag and drop (broadcast semantics) rather than backpressuring the
//! engine.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::engine::RunResult;
use crate::error::ErrorKind;
use crate::resource::PressureLevel;
use crate::state::{OrderEvent, OrderState};

/// Default broadcast channel capacity.
const DEFAULT_CAPACITY: usize = 256;

/// A structured event emitted by the engine or one of its components.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    // State machine.
    StateChanged {
        work_order_id: Uuid,
        from: OrderState,
        to: OrderState,
        event: OrderEvent,
        metadata: serde_json::Value,
        at: DateTime<Utc>,
    },
    TerminalReached {
        work_order_id: Uuid,
        state: OrderState,
        at: DateTime<Utc>,
    },

    // Scheduler.
    WorkClaimed {
        work_order_id: Uuid,
        slot_id: Uuid,
    },
    QueueEmpty,
    Backpressure {
        depth: usize,
    },
    StaggerWait {
        work_order_id: Uuid,
        remaining_ms: u64,
    },

    // Resources.
    SlotAvailable {
        slot_id: Uuid,
    },
    MemoryPressure {
        level: PressureLevel,
    },

    // Engine.
    RunStarted {
        run_id: Uuid,
        work_order_id: Uuid,
    },
    IterationStarted {
        run_id: Uuid,
        iteration: u32,
    },
    IterationCompleted {
        run_id: Uuid,
        iteration: u32,
        success: bool,
    },
    RunCompleted {
        run_id: Uuid,
        work_order_id: Uuid,
        result: RunResult,
    },
    RunFailed {
        run_id: Uuid,
        work_order_id: Uuid,
        result: RunResult,
        error: Option<ErrorKind>,
    },
    RunCanceled {
        run_id: Uuid,
        work_order_id: Uuid,
        reason: String,
    },
}

/// Cheap-to-clone handle onto the broadcast channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Dropped silently when nobody is subscribed.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Subscribe as a `Stream`, for the observability taps.
    pub fn stream(&self) -> BroadcastStream<EngineEvent> {
        BroadcastStream::new(self.tx.subscribe())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
