//! Engine error taxonomy.
//!
//! Failures are classified by [`ErrorKind`] so the engine can decide,
//! per kind, whether a failed phase is worth retrying. [`EngineError`]
//! is the structured error type surfaced at component boundaries;
//! capability implementations report plain `anyhow` errors which the
//! phase orchestrator converts into kinds.

use std::fmt;

use crate::state::{OrderEvent, OrderState};

/// How an agent invocation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildFailureKind {
    /// The agent exceeded its per-invocation timeout.
    AgentTimeout,
    /// The agent process died abnormally. Not retryable.
    AgentCrash,
    /// The agent ran to completion but reported failure.
    AgentFailure,
}

impl fmt::Display for BuildFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AgentTimeout => "agent_timeout",
            Self::AgentCrash => "agent_crash",
            Self::AgentFailure => "agent_failure",
        };
        f.write_str(s)
    }
}

/// Classification of everything that can go wrong during a run.
///
/// Kinds, not types: the same kind may originate from several call
/// sites, and retry policy is decided per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Input failed structural checks. Fatal.
    ValidationError,
    /// The agent returned non-success.
    BuildFailure(BuildFailureKind),
    /// Workspace snapshot capture failed.
    SnapshotFailure,
    /// Verification returned `passed = false`. Not an engine-level
    /// error; routed to the convergence controller.
    VerificationFailedRetryable,
    /// The convergence controller decided to stop.
    VerificationFailedTerminal,
    /// Wall-clock budget exceeded.
    Timeout,
    /// External cancel.
    Cancelled,
    /// The engine refused to accept a new run.
    ConcurrencyLimit,
    /// State machine misuse. Always a programmer error.
    InvalidTransition,
    /// Uncategorized failure from a capability call.
    InternalError,
}

impl ErrorKind {
    /// Whether failures of this kind are eligible for a scheduled retry.
    ///
    /// Eligibility is necessary but not sufficient: the retry budget is
    /// checked separately (see [`ErrorKind::retry_cap`]).
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::BuildFailure(BuildFailureKind::AgentCrash) => false,
            Self::BuildFailure(_) => true,
            Self::SnapshotFailure => true,
            Self::InternalError => true,
            Self::ValidationError
            | Self::VerificationFailedRetryable
            | Self::VerificationFailedTerminal
            | Self::Timeout
            | Self::Cancelled
            | Self::ConcurrencyLimit
            | Self::InvalidTransition => false,
        }
    }

    /// The retry budget for this kind, given the configured maximum.
    ///
    /// Internal errors are retried at most once regardless of the
    /// configured budget.
    pub fn retry_cap(&self, configured_max: u32) -> u32 {
        match self {
            Self::InternalError => configured_max.min(1),
            _ => configured_max,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ValidationError => "validation_error",
            Self::BuildFailure(k) => return write!(f, "build_failure:{k}"),
            Self::SnapshotFailure => "snapshot_failure",
            Self::VerificationFailedRetryable => "verification_failed_retryable",
            Self::VerificationFailedTerminal => "verification_failed_terminal",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::ConcurrencyLimit => "concurrency_limit",
            Self::InvalidTransition => "invalid_transition",
            Self::InternalError => "internal_error",
        };
        f.write_str(s)
    }
}

/// Structured errors returned by engine components.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(
        "invalid state transition: event {event} not allowed in state {current} \
         (valid events: {})",
        format_events(.allowed)
    )]
    InvalidTransition {
        current: OrderState,
        event: OrderEvent,
        allowed: Vec<OrderEvent>,
    },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("concurrency limit reached: {active} active runs (max {max})")]
    ConcurrencyLimit { active: usize, max: usize },

    #[error("queue at capacity ({depth} entries), enqueue rejected")]
    Backpressure { depth: usize },

    #[error("unknown work order {0}")]
    UnknownOrder(uuid::Uuid),

    #[error("unknown run {0}")]
    UnknownRun(uuid::Uuid),
}

impl EngineError {
    /// Map this error onto the taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Self::Validation(_) => ErrorKind::ValidationError,
            Self::ConcurrencyLimit { .. } => ErrorKind::ConcurrencyLimit,
            Self::Backpressure { .. } => ErrorKind::InternalError,
            Self::UnknownOrder(_) | Self::UnknownRun(_) => ErrorKind::ValidationError,
        }
    }
}

fn format_events(events: &[OrderEvent]) -> String {
    if events.is_empty() {
        return "none".to_owned();
    }
    events
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crash_is_not_retryable() {
        assert!(!ErrorKind::BuildFailure(BuildFailureKind::AgentCrash).is_retryable());
        assert!(ErrorKind::BuildFailure(BuildFailureKind::AgentTimeout).is_retryable());
        assert!(ErrorKind::BuildFailure(BuildFailureKind::AgentFailure).is_retryable());
    }

    #[test]
    fn internal_error_capped_at_one_retry() {
        assert_eq!(ErrorKind::InternalError.retry_cap(3), 1);
        assert_eq!(ErrorKind::InternalError.retry_cap(0), 0);
        assert_eq!(ErrorKind::SnapshotFailure.retry_cap(3), 3);
    }

    #[test]
    fn display_matches_taxonomy_names() {
        assert_eq!(ErrorKind::ValidationError.to_string(), "validation_error");
        assert_eq!(
            ErrorKind::BuildFailure(BuildFailureKind::AgentTimeout).to_string(),
            "build_failure:agent_timeout"
        );
        assert_eq!(ErrorKind::InvalidTransition.to_string(), "invalid_transition");
    }
}
