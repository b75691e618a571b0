//! The assembled control plane.
//!
//! Wires the state store, resource monitor, scheduler, retry manager,
//! and execution engine onto one event bus, and exposes the caller
//! surface: submit, cancel, health, shutdown. Components never hold
//! references to each other beyond what is wired here; everything else
//! flows through bus events and channels.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::capability::Capabilities;
use crate::config::AgentGateConfig;
use crate::convergence::StrategyRegistry;
use crate::engine::{ExecutionEngine, RunStatus};
use crate::error::EngineError;
use crate::events::{EngineEvent, EventBus};
use crate::health::{HealthChecker, HealthReport};
use crate::order::{ExecutionInput, WorkOrder};
use crate::resource::{ResourceMonitor, Slot};
use crate::retry::{RetryFired, RetryManager};
use crate::sched::{ExecutionHandler, Scheduler};
use crate::state::{OrderState, StateStore};

/// How long shutdown waits for in-flight runs to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

type InputMap = Arc<Mutex<HashMap<Uuid, ExecutionInput>>>;

/// Bridges claimed work orders into the engine.
struct EngineHandler {
    engine: Arc<ExecutionEngine>,
    monitor: Arc<ResourceMonitor>,
    states: Arc<StateStore>,
    inputs: InputMap,
}

#[async_trait]
impl ExecutionHandler for EngineHandler {
    async fn execute(&self, order: WorkOrder, slot: Slot) {
        let input = self
            .inputs
            .lock()
            .expect("input map poisoned")
            .get(&order.id)
            .cloned();
        let Some(input) = input else {
            tracing::error!(work_order_id = %order.id, "claimed order has no stored input");
            self.monitor.release_slot(&slot);
            if let Some(record) = self.states.get(order.id) {
                let _ = record.lock().expect("state record poisoned").fail(
                    false,
                    "validation_error",
                    "execution input missing for claimed order",
                );
            }
            return;
        };
        if let Err(e) = self.engine.execute(input, slot).await {
            tracing::warn!(work_order_id = %order.id, error = %e, "engine refused run");
        }
    }
}

/// The fully wired control plane.
pub struct ControlPlane {
    cfg: AgentGateConfig,
    bus: EventBus,
    states: Arc<StateStore>,
    monitor: Arc<ResourceMonitor>,
    scheduler: Arc<Scheduler>,
    retries: Arc<RetryManager>,
    engine: Arc<ExecutionEngine>,
    health: HealthChecker,
    inputs: InputMap,
    shutdown_token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ControlPlane {
    /// Assemble and start the background loops (memory sampler,
    /// scheduler poller, retry pump, terminal janitor).
    pub fn new(cfg: AgentGateConfig, caps: Capabilities) -> Arc<Self> {
        let bus = EventBus::new(cfg.event_capacity);
        let states = Arc::new(StateStore::new());
        let monitor = Arc::new(ResourceMonitor::new(cfg.resources.clone(), bus.clone()));
        let (retries, fired_rx) = RetryManager::new(cfg.retry.clone());
        let retries = Arc::new(retries);
        let scheduler = Arc::new(Scheduler::new(
            cfg.scheduler.clone(),
            bus.clone(),
            Arc::clone(&monitor),
            Arc::clone(&states),
        ));
        let strategies = Arc::new(StrategyRegistry::with_builtins());
        let engine = Arc::new(ExecutionEngine::new(
            cfg.engine.clone(),
            caps,
            Arc::clone(&states),
            Arc::clone(&monitor),
            Arc::clone(&retries),
            strategies,
            bus.clone(),
        ));
        let health = HealthChecker::new(
            cfg.health.clone(),
            Arc::clone(&states),
            Arc::clone(&monitor),
            Arc::clone(&scheduler),
            Arc::clone(&retries),
        );

        let inputs: InputMap = Arc::new(Mutex::new(HashMap::new()));
        let shutdown_token = CancellationToken::new();

        scheduler.set_handler(Arc::new(EngineHandler {
            engine: Arc::clone(&engine),
            monitor: Arc::clone(&monitor),
            states: Arc::clone(&states),
            inputs: Arc::clone(&inputs),
        }));

        let plane = Arc::new(Self {
            cfg,
            bus,
            states,
            monitor,
            scheduler,
            retries,
            engine,
            health,
            inputs,
            shutdown_token,
            tasks: Mutex::new(Vec::new()),
        });

        let mut tasks = plane.tasks.lock().expect("task list poisoned");
        tasks.push(plane.monitor.spawn_sampler(plane.shutdown_token.clone()));
        tasks.push(plane.scheduler.spawn_poller(plane.shutdown_token.clone()));
        tasks.push(plane.spawn_retry_pump(fired_rx));
        tasks.push(plane.spawn_terminal_janitor());
        drop(tasks);

        plane
    }

    /// Accept a work order: create its state machine and queue it.
    ///
    /// Rejects duplicates and propagates scheduler backpressure, in
    /// which case nothing is retained.
    pub fn submit(&self, input: ExecutionInput) -> Result<Uuid, EngineError> {
        let order_id = input.work_order.id;
        {
            let mut inputs = self.inputs.lock().expect("input map poisoned");
            if inputs.contains_key(&order_id) || self.states.get(order_id).is_some() {
                return Err(EngineError::Validation(format!(
                    "work order {order_id} already submitted"
                )));
            }
            inputs.insert(order_id, input.clone());
        }
        self.states
            .insert(order_id, self.cfg.retry.max_retries, self.bus.clone());

        if let Err(e) = self.scheduler.enqueue(input.work_order) {
            self.inputs
                .lock()
                .expect("input map poisoned")
                .remove(&order_id);
            self.states.remove(order_id);
            return Err(e);
        }
        tracing::info!(work_order_id = %order_id, "work order submitted");
        Ok(order_id)
    }

    /// Cancel a work order wherever it currently is.
    ///
    /// Pending and waiting-retry orders cancel immediately (queue entry
    /// removed, timer disarmed). Preparing/running orders cancel
    /// cooperatively through the engine. Cancelling an already
    /// terminal order succeeds without any state change.
    pub fn cancel(&self, work_order_id: Uuid, reason: &str) -> Result<(), EngineError> {
        let record = self
            .states
            .get(work_order_id)
            .ok_or(EngineError::UnknownOrder(work_order_id))?;

        // Pull the order out of the queue first so a concurrent claim
        // cannot race the cancellation.
        let removed_from_queue = self.scheduler.remove(work_order_id).is_some();

        let state = record.lock().expect("state record poisoned").state();
        match state {
            OrderState::Pending => {
                record
                    .lock()
                    .expect("state record poisoned")
                    .cancel(reason)?;
                Ok(())
            }
            OrderState::WaitingRetry => {
                self.retries.cancel(work_order_id);
                record
                    .lock()
                    .expect("state record poisoned")
                    .cancel(reason)?;
                Ok(())
            }
            OrderState::Preparing | OrderState::Running => {
                if removed_from_queue {
                    tracing::warn!(%work_order_id, "order was queued while executing");
                }
                if !self.engine.cancel_by_order(work_order_id, reason) {
                    // The run finished in between; nothing left to do.
                    tracing::debug!(%work_order_id, "no active run to cancel");
                }
                Ok(())
            }
            OrderState::Completed | OrderState::Failed | OrderState::Cancelled => Ok(()),
        }
    }

    pub fn order_state(&self, work_order_id: Uuid) -> Option<OrderState> {
        self.states.state_of(work_order_id)
    }

    pub fn run_status(&self, run_id: Uuid) -> Result<RunStatus, EngineError> {
        self.engine.status(run_id)
    }

    pub fn active_runs(&self) -> usize {
        self.engine.active_count()
    }

    pub fn health(&self) -> HealthReport {
        self.health.check()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn engine(&self) -> &Arc<ExecutionEngine> {
        &self.engine
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.monitor
    }

    pub fn retries(&self) -> &Arc<RetryManager> {
        &self.retries
    }

    pub fn states(&self) -> &Arc<StateStore> {
        &self.states
    }

    /// Stop claiming, stop the background loops, and wait briefly for
    /// in-flight runs to drain.
    pub async fn shutdown(&self) {
        tracing::info!("control plane shutting down");
        self.shutdown_token.cancel();

        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        while self.engine.active_count() > 0 {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    remaining = self.engine.active_count(),
                    "drain timeout expired with runs still in flight"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let tasks: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.tasks.lock().expect("task list poisoned"));
        for task in tasks {
            if tokio::time::timeout(Duration::from_secs(1), task).await.is_err() {
                tracing::warn!("background task did not stop in time");
            }
        }
    }

    /// Pump fired retry timers back into the queue: RETRY transition
    /// first (waiting_retry -> pending), then re-enqueue.
    fn spawn_retry_pump(
        self: &Arc<Self>,
        mut fired_rx: mpsc::UnboundedReceiver<RetryFired>,
    ) -> JoinHandle<()> {
        let plane = Arc::clone(self);
        let cancel = self.shutdown_token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    fired = fired_rx.recv() => match fired {
                        Some(fired) => plane.handle_retry_fired(fired),
                        None => break,
                    },
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }

    fn handle_retry_fired(&self, fired: RetryFired) {
        let RetryFired {
            work_order_id,
            attempt,
        } = fired;

        let Some(record) = self.states.get(work_order_id) else {
            tracing::warn!(%work_order_id, "retry fired for unknown order");
            return;
        };
        {
            let mut r = record.lock().expect("state record poisoned");
            match r.retry() {
                Ok(_) => {}
                Err(e) => {
                    // Typically a cancel won the race.
                    tracing::debug!(%work_order_id, error = %e, "retry transition skipped");
                    return;
                }
            }
        }

        let order = self
            .inputs
            .lock()
            .expect("input map poisoned")
            .get(&work_order_id)
            .map(|input| input.work_order.clone());
        let Some(order) = order else {
            tracing::error!(%work_order_id, "retry fired but input is gone");
            return;
        };

        tracing::info!(%work_order_id, attempt, "re-enqueueing after retry delay");
        if let Err(e) = self.scheduler.enqueue(order.clone()) {
            // Queue full. The order is already back in pending, so keep
            // knocking until the queue has room rather than dropping it.
            tracing::warn!(%work_order_id, error = %e, "re-enqueue rejected, will keep trying");
            let scheduler = Arc::clone(&self.scheduler);
            let cancel = self.shutdown_token.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {
                            if scheduler.enqueue(order.clone()).is_ok() {
                                break;
                            }
                        }
                        _ = cancel.cancelled() => break,
                    }
                }
            });
        }
    }

    /// Drop retained inputs (and any stray retry timer) once an order
    /// reaches a terminal state.
    fn spawn_terminal_janitor(self: &Arc<Self>) -> JoinHandle<()> {
        let plane = Arc::clone(self);
        let cancel = self.shutdown_token.clone();
        let mut events = self.bus.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(EngineEvent::TerminalReached { work_order_id, .. }) => {
                            plane
                                .inputs
                                .lock()
                                .expect("input map poisoned")
                                .remove(&work_order_id);
                            plane.retries.cancel(work_order_id);
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::debug!(skipped, "janitor lagged on event bus");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }
}
