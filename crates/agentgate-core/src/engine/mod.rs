//! The execution engine: owns a run from slot claim to terminal state.
//!
//! The engine validates the input, captures the workspace's before
//! state, then drives the phase orchestrator under the convergence
//! controller until the gates pass, the controller stops the loop, a
//! budget expires, or the run is cancelled. Failure classification and
//! the retry hand-off to the retry manager both live here.

mod run;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use run::{ExecutionResult, IterationRecord, Run, RunMetrics, RunResult, RunStatus};

use crate::capability::Capabilities;
use crate::convergence::{ConvergenceController, StrategyRegistry};
use crate::error::{EngineError, ErrorKind};
use crate::events::{EngineEvent, EventBus};
use crate::order::ExecutionInput;
use crate::phase::{IterationContext, IterationVerdict, PhaseOrchestrator};
use crate::resource::{ResourceMonitor, Slot};
use crate::retry::RetryManager;
use crate::state::{OrderState, StateStore};

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Hard cap on concurrent runs, independent of the slot pool.
    pub max_concurrent_runs: usize,
    /// Per-phase timeout ceiling in milliseconds; the effective value
    /// is the smaller of this and the order's wall-clock budget.
    pub default_phase_timeout_ms: u64,
}

impl EngineConfig {
    pub fn default_phase_timeout(&self) -> Duration {
        Duration::from_millis(self.default_phase_timeout_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 32,
            // 5 minutes.
            default_phase_timeout_ms: 5 * 60 * 1000,
        }
    }
}

/// Bookkeeping for a run in flight.
struct ActiveRun {
    run_id: Uuid,
    work_order_id: Uuid,
    cancel: CancellationToken,
    cancel_reason: Mutex<Option<String>>,
    started: Instant,
    iteration: AtomicU32,
    in_pipeline: std::sync::atomic::AtomicBool,
}

/// How a run ends, decided by the iteration loop and applied once in
/// the epilogue.
enum RunEnd {
    Completed,
    Failed {
        result: RunResult,
        kind: ErrorKind,
        message: String,
    },
    /// Retryable failure within budget: order parks in waiting_retry.
    Parked { kind: ErrorKind, message: String },
    Cancelled { reason: String },
}

/// Drives work orders through the iterate-verify-feedback loop.
pub struct ExecutionEngine {
    cfg: EngineConfig,
    orchestrator: PhaseOrchestrator,
    caps: Capabilities,
    states: Arc<StateStore>,
    monitor: Arc<ResourceMonitor>,
    retries: Arc<RetryManager>,
    strategies: Arc<StrategyRegistry>,
    bus: EventBus,
    active: Mutex<HashMap<Uuid, Arc<ActiveRun>>>,
}

impl ExecutionEngine {
    pub fn new(
        cfg: EngineConfig,
        caps: Capabilities,
        states: Arc<StateStore>,
        monitor: Arc<ResourceMonitor>,
        retries: Arc<RetryManager>,
        strategies: Arc<StrategyRegistry>,
        bus: EventBus,
    ) -> Self {
        Self {
            cfg,
            orchestrator: PhaseOrchestrator::new(caps.clone()),
            caps,
            states,
            monitor,
            retries,
            strategies,
            bus,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Number of runs currently executing.
    pub fn active_count(&self) -> usize {
        self.active.lock().expect("active runs poisoned").len()
    }

    /// Request cooperative cancellation of a run.
    ///
    /// The in-flight phase completes, its result is discarded, and the
    /// run terminates at the next boundary.
    pub fn cancel(&self, run_id: Uuid, reason: &str) -> Result<(), EngineError> {
        let active = self.active.lock().expect("active runs poisoned");
        let Some(entry) = active.get(&run_id) else {
            return Err(EngineError::UnknownRun(run_id));
        };
        *entry.cancel_reason.lock().expect("cancel reason poisoned") = Some(reason.to_owned());
        entry.cancel.cancel();
        tracing::info!(%run_id, reason, "run cancellation requested");
        Ok(())
    }

    /// Cancel whichever active run is executing the given work order.
    pub fn cancel_by_order(&self, work_order_id: Uuid, reason: &str) -> bool {
        let run_id = {
            let active = self.active.lock().expect("active runs poisoned");
            active
                .values()
                .find(|entry| entry.work_order_id == work_order_id)
                .map(|entry| entry.run_id)
        };
        match run_id {
            Some(run_id) => self.cancel(run_id, reason).is_ok(),
            None => false,
        }
    }

    /// Live status of a run.
    pub fn status(&self, run_id: Uuid) -> Result<RunStatus, EngineError> {
        let active = self.active.lock().expect("active runs poisoned");
        let entry = active.get(&run_id).ok_or(EngineError::UnknownRun(run_id))?;
        let state = self
            .states
            .state_of(entry.work_order_id)
            .unwrap_or(OrderState::Running);
        Ok(RunStatus {
            run_id,
            work_order_id: entry.work_order_id,
            state,
            iteration: entry.iteration.load(Ordering::Relaxed),
            elapsed_ms: entry.started.elapsed().as_millis() as u64,
            phase: entry
                .in_pipeline
                .load(Ordering::Relaxed)
                .then(|| "iterating".to_owned()),
        })
    }

    /// Execute one work order. The caller hands over the slot; the
    /// engine releases it on every exit path.
    ///
    /// Returns `Err` only for the structured concurrency-limit
    /// refusal; all other failures are encoded in the returned run.
    pub async fn execute(
        &self,
        input: ExecutionInput,
        slot: Slot,
    ) -> Result<ExecutionResult, EngineError> {
        let order = &input.work_order;
        let record = self.states.get(order.id).unwrap_or_else(|| {
            self.states
                .insert(order.id, self.retries.policy().max_retries, self.bus.clone())
        });
        {
            // Standalone use without a scheduler in front: claim the
            // order ourselves.
            let mut r = record.lock().expect("state record poisoned");
            if r.state() == OrderState::Pending {
                let _ = r.claim(slot.id);
            }
        }

        let mut run = Run::new(order.id, slot);

        // Concurrency-limit refusal: caller's problem, never retried.
        let active_entry = {
            let mut active = self.active.lock().expect("active runs poisoned");
            if active.len() >= self.cfg.max_concurrent_runs {
                let err = EngineError::ConcurrencyLimit {
                    active: active.len(),
                    max: self.cfg.max_concurrent_runs,
                };
                drop(active);
                tracing::warn!(work_order_id = %order.id, %err, "run refused");
                self.monitor.release_slot(&run.slot);
                let mut r = record.lock().expect("state record poisoned");
                let _ = r.fail(false, "concurrency_limit", &err.to_string());
                return Err(err);
            }
            let entry = Arc::new(ActiveRun {
                run_id: run.id,
                work_order_id: order.id,
                cancel: CancellationToken::new(),
                cancel_reason: Mutex::new(None),
                started: Instant::now(),
                iteration: AtomicU32::new(0),
                in_pipeline: std::sync::atomic::AtomicBool::new(false),
            });
            active.insert(run.id, Arc::clone(&entry));
            entry
        };

        let end = self.drive(&input, &mut run, &record, &active_entry).await;
        let result = self.finish(input, run, &record, end);

        self.active
            .lock()
            .expect("active runs poisoned")
            .remove(&result.run.id);

        Ok(result)
    }

    /// The iteration loop. Returns how the run ends; all state-machine
    /// and event work happens in [`Self::finish`].
    async fn drive(
        &self,
        input: &ExecutionInput,
        run: &mut Run,
        record: &Arc<Mutex<crate::state::StateRecord>>,
        active: &Arc<ActiveRun>,
    ) -> RunEnd {
        let order = &input.work_order;
        let spec = &input.resolved_spec;

        // 1. Validate: resolved prompt, gate plan, acquired workspace.
        if let Err(message) = validate_input(input) {
            tracing::warn!(work_order_id = %order.id, %message, "input validation failed");
            return RunEnd::Failed {
                result: RunResult::FailedError,
                kind: ErrorKind::ValidationError,
                message,
            };
        }

        // 2. Capture the before state while the order is preparing.
        let before = match self
            .caps
            .snapshotter
            .capture_before(&spec.workspace_path)
            .await
        {
            Ok(before) => before,
            Err(e) => {
                let message = format!("before-state capture failed: {e:#}");
                return self.classify_failure(record, ErrorKind::SnapshotFailure, message);
            }
        };
        run.before_state = Some(before.clone());

        // 3. Preparing -> running.
        {
            let mut r = record.lock().expect("state record poisoned");
            if let Err(e) = r.ready() {
                return RunEnd::Failed {
                    result: RunResult::FailedError,
                    kind: ErrorKind::InvalidTransition,
                    message: e.to_string(),
                };
            }
        }

        self.bus.emit(EngineEvent::RunStarted {
            run_id: run.id,
            work_order_id: order.id,
        });
        tracing::info!(
            run_id = %run.id,
            work_order_id = %order.id,
            strategy = spec.convergence.kind(),
            "run started"
        );

        let mut controller = match self.strategies.create(&spec.convergence) {
            Ok(strategy) => ConvergenceController::new(strategy),
            Err(e) => {
                return RunEnd::Failed {
                    result: RunResult::FailedError,
                    kind: ErrorKind::ValidationError,
                    message: e.to_string(),
                };
            }
        };

        let wall_clock = order.limits.max_wall_clock();
        let phase_timeout = self.cfg.default_phase_timeout().min(wall_clock);

        // 4. Iterate.
        let mut iteration: u32 = 0;
        loop {
            iteration += 1;

            // Wall clock always wins.
            if active.started.elapsed() >= wall_clock {
                return RunEnd::Failed {
                    result: RunResult::FailedTimeout,
                    kind: ErrorKind::Timeout,
                    message: format!("wall clock budget of {}s exhausted", wall_clock.as_secs()),
                };
            }
            if active.cancel.is_cancelled() {
                return RunEnd::Cancelled {
                    reason: self.cancel_reason(active),
                };
            }
            // Hard backstop over whatever the strategy decides.
            if iteration > order.limits.max_iterations {
                return RunEnd::Failed {
                    result: RunResult::FailedVerification,
                    kind: ErrorKind::VerificationFailedTerminal,
                    message: format!(
                        "iteration limit of {} reached",
                        order.limits.max_iterations
                    ),
                };
            }

            active.iteration.store(iteration, Ordering::Relaxed);
            active.in_pipeline.store(true, Ordering::Relaxed);
            self.bus.emit(EngineEvent::IterationStarted {
                run_id: run.id,
                iteration,
            });

            let outcome = self
                .orchestrator
                .run_iteration(IterationContext {
                    run_id: run.id,
                    work_order: order,
                    spec,
                    iteration,
                    feedback: run.pending_feedback.take(),
                    session_id: run.session_id.clone(),
                    before: run.before_state.as_ref().expect("before state captured"),
                    phase_timeout,
                    cancel: &active.cancel,
                })
                .await;
            active.in_pipeline.store(false, Ordering::Relaxed);

            // Session continuity survives failed iterations.
            run.session_id = outcome.session_id.clone();

            if outcome.verdict == IterationVerdict::Cancelled || active.cancel.is_cancelled() {
                // In-flight phase work completed; its result is
                // discarded.
                return RunEnd::Cancelled {
                    reason: self.cancel_reason(active),
                };
            }

            run.iterations.push(IterationRecord::from(&outcome));
            self.bus.emit(EngineEvent::IterationCompleted {
                run_id: run.id,
                iteration,
                success: outcome.success,
            });

            match outcome.verdict {
                IterationVerdict::VerifyPassed => return RunEnd::Completed,

                IterationVerdict::VerifyFailedRetryable => {
                    let decision = controller.decide(
                        iteration,
                        &spec.gate_plan,
                        outcome.report.as_ref(),
                        outcome.agent_output.as_deref(),
                        outcome
                            .snapshot
                            .as_ref()
                            .and_then(|s| s.fingerprint.as_deref()),
                    );
                    if decision.is_continue() {
                        run.pending_feedback = outcome.feedback.clone();
                        continue;
                    }
                    return RunEnd::Failed {
                        result: RunResult::FailedVerification,
                        kind: ErrorKind::VerificationFailedTerminal,
                        message: decision.reason,
                    };
                }

                IterationVerdict::BuildFailed(_)
                | IterationVerdict::SnapshotFailed
                | IterationVerdict::InternalError(_) => {
                    let (kind, message) = outcome
                        .error
                        .clone()
                        .unwrap_or((ErrorKind::InternalError, "phase failed".to_owned()));
                    return self.classify_failure(record, kind, message);
                }

                IterationVerdict::Cancelled => unreachable!("handled above"),
            }
        }
    }

    /// Map a phase failure onto retry-or-fail.
    fn classify_failure(
        &self,
        record: &Arc<Mutex<crate::state::StateRecord>>,
        kind: ErrorKind,
        message: String,
    ) -> RunEnd {
        let retry_count = record
            .lock()
            .expect("state record poisoned")
            .retry_count();
        let cap = kind.retry_cap(self.retries.policy().max_retries);
        if kind.is_retryable() && retry_count < cap {
            RunEnd::Parked { kind, message }
        } else {
            let result = match kind {
                ErrorKind::BuildFailure(_) => RunResult::FailedBuild,
                _ => RunResult::FailedError,
            };
            RunEnd::Failed {
                result,
                kind,
                message,
            }
        }
    }

    fn cancel_reason(&self, active: &ActiveRun) -> String {
        active
            .cancel_reason
            .lock()
            .expect("cancel reason poisoned")
            .clone()
            .unwrap_or_else(|| "cancelled".to_owned())
    }

    /// Epilogue: release the slot, apply the terminal (or parking)
    /// transition, emit run events, and assemble the result.
    ///
    /// The slot is released before the transition so `terminal-reached`
    /// observers always see it free.
    fn finish(
        &self,
        input: ExecutionInput,
        mut run: Run,
        record: &Arc<Mutex<crate::state::StateRecord>>,
        end: RunEnd,
    ) -> ExecutionResult {
        let order_id = input.work_order.id;
        run.ended_at = Some(Utc::now());
        self.monitor.release_slot(&run.slot);

        match end {
            RunEnd::Completed => {
                run.result = Some(RunResult::Passed);
                if let Err(e) = record.lock().expect("state record poisoned").complete() {
                    tracing::error!(work_order_id = %order_id, error = %e, "terminal transition failed");
                }
                self.bus.emit(EngineEvent::RunCompleted {
                    run_id: run.id,
                    work_order_id: order_id,
                    result: RunResult::Passed,
                });
                tracing::info!(run_id = %run.id, iterations = run.iterations.len(), "run completed");
            }
            RunEnd::Failed {
                result,
                kind,
                message,
            } => {
                run.result = Some(result);
                if let Err(e) = record
                    .lock()
                    .expect("state record poisoned")
                    .fail(false, &kind.to_string(), &message)
                {
                    tracing::error!(work_order_id = %order_id, error = %e, "terminal transition failed");
                }
                self.bus.emit(EngineEvent::RunFailed {
                    run_id: run.id,
                    work_order_id: order_id,
                    result,
                    error: Some(kind),
                });
                tracing::warn!(run_id = %run.id, %result, %kind, %message, "run failed");
            }
            RunEnd::Parked { kind, message } => {
                // No final result: the next claim starts a fresh run.
                let attempt = {
                    let mut r = record.lock().expect("state record poisoned");
                    match r.fail(true, &kind.to_string(), &message) {
                        Ok(OrderState::WaitingRetry) => Some(r.retry_count() + 1),
                        Ok(other) => {
                            tracing::error!(
                                work_order_id = %order_id,
                                state = %other,
                                "retryable failure did not park; treating as terminal"
                            );
                            None
                        }
                        Err(e) => {
                            tracing::error!(work_order_id = %order_id, error = %e, "parking transition failed");
                            None
                        }
                    }
                };
                if let Some(attempt) = attempt {
                    self.retries.schedule(order_id, attempt, &message);
                }
            }
            RunEnd::Cancelled { reason } => {
                run.result = Some(RunResult::Cancelled);
                if let Err(e) = record
                    .lock()
                    .expect("state record poisoned")
                    .cancel(&reason)
                {
                    tracing::error!(work_order_id = %order_id, error = %e, "cancel transition failed");
                }
                self.bus.emit(EngineEvent::RunCanceled {
                    run_id: run.id,
                    work_order_id: order_id,
                    reason: reason.clone(),
                });
                tracing::info!(run_id = %run.id, %reason, "run cancelled");
            }
        }

        let metrics = RunMetrics::from_run(&run);
        ExecutionResult {
            iterations: run.iterations.clone(),
            run,
            metrics,
            delivery: None,
        }
    }
}

/// Structural checks on the execution input.
fn validate_input(input: &ExecutionInput) -> Result<(), String> {
    let spec = &input.resolved_spec;
    if spec.task_prompt.trim().is_empty() {
        return Err("resolved task prompt is empty".to_owned());
    }
    if spec.gate_plan.is_empty() {
        return Err("gate plan has no gates".to_owned());
    }
    if spec.workspace_path.as_os_str().is_empty() {
        return Err("workspace path is empty".to_owned());
    }
    if input.work_order.limits.max_iterations == 0 {
        return Err("max_iterations must be at least 1".to_owned());
    }
    Ok(())
}
