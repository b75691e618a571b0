//! Run records and results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::capability::snapshot::BeforeState;
use crate::error::ErrorKind;
use crate::phase::{IterationOutcome, PhaseTimings};
use crate::resource::Slot;
use crate::state::OrderState;

/// Final result of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunResult {
    Passed,
    FailedVerification,
    FailedBuild,
    FailedTimeout,
    FailedError,
    Cancelled,
}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Passed => "passed",
            Self::FailedVerification => "failed_verification",
            Self::FailedBuild => "failed_build",
            Self::FailedTimeout => "failed_timeout",
            Self::FailedError => "failed_error",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Append-only record of one iteration within a run.
#[derive(Debug, Clone)]
pub struct IterationRecord {
    /// 1-based, contiguous within the run.
    pub number: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub timings: PhaseTimings,
    pub snapshot_id: Option<Uuid>,
    pub verification_passed: bool,
    pub feedback_generated: bool,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
}

impl From<&IterationOutcome> for IterationRecord {
    fn from(outcome: &IterationOutcome) -> Self {
        Self {
            number: outcome.iteration,
            started_at: outcome.started_at,
            ended_at: outcome.ended_at,
            timings: outcome.timings,
            snapshot_id: outcome.snapshot.as_ref().map(|s| s.id),
            verification_passed: outcome.success,
            feedback_generated: outcome.feedback.is_some(),
            error_kind: outcome.error.as_ref().map(|(kind, _)| *kind),
            error_message: outcome.error.as_ref().map(|(_, msg)| msg.clone()),
        }
    }
}

/// One execution of a work order.
///
/// A run that parks its order in `waiting_retry` ends without a final
/// result (`result` stays `None`); the next claim starts a fresh run at
/// iteration 1.
#[derive(Debug)]
pub struct Run {
    pub id: Uuid,
    pub work_order_id: Uuid,
    pub slot: Slot,
    pub iterations: Vec<IterationRecord>,
    /// Agent continuation token carried across iterations.
    pub session_id: Option<String>,
    /// Feedback pending for the next iteration's build.
    pub pending_feedback: Option<String>,
    pub before_state: Option<BeforeState>,
    pub result: Option<RunResult>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new(work_order_id: Uuid, slot: Slot) -> Self {
        Self {
            id: Uuid::new_v4(),
            work_order_id,
            slot,
            iterations: Vec::new(),
            session_id: None,
            pending_feedback: None,
            before_state: None,
            result: None,
            started_at: Utc::now(),
            ended_at: None,
        }
    }
}

/// Aggregate timing breakdown for a finished run.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RunMetrics {
    pub duration_ms: u64,
    pub iterations: u32,
    pub build_ms: u64,
    pub snapshot_ms: u64,
    pub verify_ms: u64,
    pub feedback_ms: u64,
}

impl RunMetrics {
    pub fn from_run(run: &Run) -> Self {
        let sum = |f: fn(&PhaseTimings) -> Option<Duration>| -> u64 {
            run.iterations
                .iter()
                .filter_map(|i| f(&i.timings))
                .map(|d| d.as_millis() as u64)
                .sum()
        };
        let ended = run.ended_at.unwrap_or_else(Utc::now);
        Self {
            duration_ms: (ended - run.started_at).num_milliseconds().max(0) as u64,
            iterations: run.iterations.len() as u32,
            build_ms: sum(|t| t.build),
            snapshot_ms: sum(|t| t.snapshot),
            verify_ms: sum(|t| t.verify),
            feedback_ms: sum(|t| t.feedback),
        }
    }
}

/// What the engine hands back when a run finishes or parks.
#[derive(Debug)]
pub struct ExecutionResult {
    pub run: Run,
    /// Copy of the run's iteration records, for callers that drop the
    /// run itself.
    pub iterations: Vec<IterationRecord>,
    pub metrics: RunMetrics,
    /// Delivery (branch/PR) outcome from a downstream deliverer; the
    /// engine itself never sets this.
    pub delivery: Option<serde_json::Value>,
}

/// Point-in-time view of an active run.
#[derive(Debug, Clone, Serialize)]
pub struct RunStatus {
    pub run_id: Uuid,
    pub work_order_id: Uuid,
    pub state: OrderState,
    /// Iteration currently executing, 0 before the first one starts.
    pub iteration: u32,
    pub elapsed_ms: u64,
    /// Coarse phase marker; `None` between iterations.
    pub phase: Option<String>,
}
