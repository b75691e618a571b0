//! One iteration through the phase pipeline.
//!
//! The orchestrator runs Build -> Snapshot -> Verify -> Feedback as an
//! ordered pipeline with a hard early exit on phase failure. Phase
//! failures never escape as errors; they are converted into a
//! structured [`IterationOutcome`] the engine classifies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::capability::snapshot::BeforeState;
use crate::capability::{
    AgentRequest, Capabilities, FeedbackContext, Snapshot, VerificationReport, VerifyRequest,
};
use crate::error::{BuildFailureKind, ErrorKind};
use crate::order::{ResolvedTaskSpec, WorkOrder};

/// Per-check excerpt cap in synthetic feedback.
const MAX_EXCERPT_CHARS: usize = 500;
/// Total synthetic feedback cap.
const MAX_FEEDBACK_CHARS: usize = 10_000;

// ---------------------------------------------------------------------------
// Outcome types
// ---------------------------------------------------------------------------

/// Where the pipeline stopped and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationVerdict {
    /// The agent invocation failed; nothing after Build ran.
    BuildFailed(BuildFailureKind),
    /// Snapshot capture failed; Verify and Feedback did not run.
    SnapshotFailed,
    /// Verification passed. The iteration succeeded.
    VerifyPassed,
    /// Verification failed; feedback was produced for the next build.
    VerifyFailedRetryable,
    /// The run was cancelled between phases.
    Cancelled,
    /// A capability call itself failed in the named phase.
    InternalError(PhaseKind),
}

/// The four pipeline phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseKind {
    Build,
    Snapshot,
    Verify,
    Feedback,
}

impl std::fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Build => "build",
            Self::Snapshot => "snapshot",
            Self::Verify => "verify",
            Self::Feedback => "feedback",
        };
        f.write_str(s)
    }
}

/// Wall-clock spent per phase.
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseTimings {
    pub build: Option<Duration>,
    pub snapshot: Option<Duration>,
    pub verify: Option<Duration>,
    pub feedback: Option<Duration>,
}

/// Everything one iteration produced.
#[derive(Debug, Clone)]
pub struct IterationOutcome {
    pub iteration: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// True iff verification passed.
    pub success: bool,
    pub verdict: IterationVerdict,
    /// Continuation token, propagated regardless of build success.
    pub session_id: Option<String>,
    /// The agent's stdout, used for completion-signal detection.
    pub agent_output: Option<String>,
    pub snapshot: Option<Snapshot>,
    pub report: Option<VerificationReport>,
    /// Feedback for the next build, when verification failed.
    pub feedback: Option<String>,
    /// Whether the feedback came from the synthetic fallback.
    pub fallback_feedback: bool,
    pub error: Option<(ErrorKind, String)>,
    pub timings: PhaseTimings,
}

impl IterationOutcome {
    fn begin(iteration: u32, session_id: Option<String>) -> Self {
        Self {
            iteration,
            started_at: Utc::now(),
            ended_at: Utc::now(),
            success: false,
            verdict: IterationVerdict::InternalError(PhaseKind::Build),
            session_id,
            agent_output: None,
            snapshot: None,
            report: None,
            feedback: None,
            fallback_feedback: false,
            error: None,
            timings: PhaseTimings::default(),
        }
    }

    fn finish(mut self, verdict: IterationVerdict) -> Self {
        self.success = verdict == IterationVerdict::VerifyPassed;
        self.verdict = verdict;
        self.ended_at = Utc::now();
        self
    }

    fn fail(mut self, verdict: IterationVerdict, kind: ErrorKind, message: String) -> Self {
        self.error = Some((kind, message));
        self.finish(verdict)
    }
}

/// Inputs for one iteration.
pub struct IterationContext<'a> {
    pub run_id: Uuid,
    pub work_order: &'a WorkOrder,
    pub spec: &'a ResolvedTaskSpec,
    /// 1-based iteration number.
    pub iteration: u32,
    /// Feedback from the previous iteration.
    pub feedback: Option<String>,
    /// Session continuation token from the previous iteration.
    pub session_id: Option<String>,
    pub before: &'a BeforeState,
    pub phase_timeout: Duration,
    pub cancel: &'a CancellationToken,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Runs one iteration through the phase pipeline.
pub struct PhaseOrchestrator {
    caps: Capabilities,
}

impl PhaseOrchestrator {
    pub fn new(caps: Capabilities) -> Self {
        Self { caps }
    }

    /// Execute one iteration. Never returns an error: every failure is
    /// folded into the outcome.
    pub async fn run_iteration(&self, ctx: IterationContext<'_>) -> IterationOutcome {
        let mut out = IterationOutcome::begin(ctx.iteration, ctx.session_id.clone());

        // --- Build -------------------------------------------------------
        let Some(driver) = self.caps.drivers.resolve(&ctx.work_order.agent_kind) else {
            return out.fail(
                IterationVerdict::InternalError(PhaseKind::Build),
                ErrorKind::InternalError,
                "no agent drivers registered".to_owned(),
            );
        };

        let request = AgentRequest {
            workspace_path: ctx.spec.workspace_path.clone(),
            task_prompt: ctx.spec.task_prompt.clone(),
            feedback: ctx.feedback.clone(),
            session_id: ctx.session_id.clone(),
            iteration: ctx.iteration,
            timeout: ctx.phase_timeout,
            constraints: Some(ctx.work_order.policies.clone()),
            cancel: ctx.cancel.clone(),
        };

        let build_start = std::time::Instant::now();
        let build = tokio::time::timeout(ctx.phase_timeout, driver.execute(request)).await;
        out.timings.build = Some(build_start.elapsed());

        let agent_result = match build {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                tracing::warn!(run_id = %ctx.run_id, iteration = ctx.iteration, error = %e, "agent driver failed");
                return out.fail(
                    IterationVerdict::InternalError(PhaseKind::Build),
                    ErrorKind::InternalError,
                    format!("agent driver error: {e:#}"),
                );
            }
            Err(_elapsed) => {
                tracing::warn!(run_id = %ctx.run_id, iteration = ctx.iteration, "agent timed out");
                return out.fail(
                    IterationVerdict::BuildFailed(BuildFailureKind::AgentTimeout),
                    ErrorKind::BuildFailure(BuildFailureKind::AgentTimeout),
                    format!("agent exceeded {}s phase timeout", ctx.phase_timeout.as_secs()),
                );
            }
        };

        // Session id is propagated even when the build failed, so the
        // next invocation can resume the agent's reasoning.
        if agent_result.session_id.is_some() {
            out.session_id = agent_result.session_id.clone();
        }
        out.agent_output = Some(agent_result.stdout.clone());

        if let Err(e) = self
            .caps
            .persister
            .save_agent_result(ctx.run_id, ctx.iteration, &agent_result)
            .await
        {
            tracing::warn!(run_id = %ctx.run_id, error = %e, "failed to persist agent result (best-effort)");
        }

        if !agent_result.success {
            let kind = agent_result.failure.unwrap_or(BuildFailureKind::AgentFailure);
            let message = if agent_result.stderr.is_empty() {
                format!("agent reported failure ({kind})")
            } else {
                truncate_chars(&agent_result.stderr, MAX_EXCERPT_CHARS)
            };
            return out.fail(
                IterationVerdict::BuildFailed(kind),
                ErrorKind::BuildFailure(kind),
                message,
            );
        }

        if ctx.cancel.is_cancelled() {
            return out.fail(
                IterationVerdict::Cancelled,
                ErrorKind::Cancelled,
                "cancelled after build".to_owned(),
            );
        }

        // --- Snapshot ----------------------------------------------------
        let snapshot_start = std::time::Instant::now();
        let snapshot = tokio::time::timeout(
            ctx.phase_timeout,
            self.caps.snapshotter.capture(
                &ctx.spec.workspace_path,
                ctx.before,
                ctx.run_id,
                ctx.iteration,
                &ctx.spec.task_prompt,
            ),
        )
        .await;
        out.timings.snapshot = Some(snapshot_start.elapsed());

        let snapshot = match snapshot {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(e)) => {
                tracing::warn!(run_id = %ctx.run_id, iteration = ctx.iteration, error = %e, "snapshot capture failed");
                return out.fail(
                    IterationVerdict::SnapshotFailed,
                    ErrorKind::SnapshotFailure,
                    format!("snapshot capture failed: {e:#}"),
                );
            }
            Err(_elapsed) => {
                return out.fail(
                    IterationVerdict::SnapshotFailed,
                    ErrorKind::SnapshotFailure,
                    "snapshot capture timed out".to_owned(),
                );
            }
        };
        out.snapshot = Some(snapshot.clone());

        if ctx.cancel.is_cancelled() {
            return out.fail(
                IterationVerdict::Cancelled,
                ErrorKind::Cancelled,
                "cancelled after snapshot".to_owned(),
            );
        }

        // --- Verify ------------------------------------------------------
        let verify_start = std::time::Instant::now();
        let verify = tokio::time::timeout(
            ctx.phase_timeout,
            self.caps.verifier.verify(VerifyRequest {
                snapshot_path: ctx.spec.workspace_path.clone(),
                gate_plan: ctx.spec.gate_plan.clone(),
                run_id: ctx.run_id,
                iteration: ctx.iteration,
                timeout: ctx.phase_timeout,
                skip_levels: ctx.spec.gate_plan.skip_levels.clone(),
            }),
        )
        .await;
        out.timings.verify = Some(verify_start.elapsed());

        let report = match verify {
            Ok(Ok(report)) => report,
            Ok(Err(e)) => {
                tracing::warn!(run_id = %ctx.run_id, iteration = ctx.iteration, error = %e, "verifier failed");
                return out.fail(
                    IterationVerdict::InternalError(PhaseKind::Verify),
                    ErrorKind::InternalError,
                    format!("verifier error: {e:#}"),
                );
            }
            Err(_elapsed) => {
                return out.fail(
                    IterationVerdict::InternalError(PhaseKind::Verify),
                    ErrorKind::InternalError,
                    "verifier timed out".to_owned(),
                );
            }
        };

        if let Err(e) = self
            .caps
            .persister
            .save_verification(ctx.run_id, ctx.iteration, &report)
            .await
        {
            tracing::warn!(run_id = %ctx.run_id, error = %e, "failed to persist verification (best-effort)");
        }
        out.report = Some(report.clone());

        if report.passed {
            tracing::info!(run_id = %ctx.run_id, iteration = ctx.iteration, "verification passed");
            return out.finish(IterationVerdict::VerifyPassed);
        }

        // --- Feedback ----------------------------------------------------
        // Only runs after a failed verification, and always succeeds:
        // a generator failure falls back to synthetic feedback.
        let feedback_start = std::time::Instant::now();
        let generated = tokio::time::timeout(
            ctx.phase_timeout,
            self.caps.feedback.generate(
                &snapshot,
                &report,
                &ctx.spec.gate_plan,
                &FeedbackContext {
                    run_id: ctx.run_id,
                    iteration: ctx.iteration,
                    task_prompt: ctx.spec.task_prompt.clone(),
                },
            ),
        )
        .await;
        out.timings.feedback = Some(feedback_start.elapsed());

        let (feedback, fallback) = match generated {
            Ok(Ok(text)) if !text.is_empty() => (text, false),
            Ok(Ok(_)) => (synthetic_feedback(&report), true),
            Ok(Err(e)) => {
                tracing::warn!(run_id = %ctx.run_id, error = %e, "feedback generator failed, using fallback");
                (synthetic_feedback(&report), true)
            }
            Err(_elapsed) => {
                tracing::warn!(run_id = %ctx.run_id, "feedback generator timed out, using fallback");
                (synthetic_feedback(&report), true)
            }
        };
        out.feedback = Some(feedback);
        out.fallback_feedback = fallback;

        out.fail(
            IterationVerdict::VerifyFailedRetryable,
            ErrorKind::VerificationFailedRetryable,
            "verification failed".to_owned(),
        )
    }
}

// ---------------------------------------------------------------------------
// Synthetic feedback
// ---------------------------------------------------------------------------

/// Deterministic feedback derived straight from the report: failed
/// checks in L0..L3 order, bulleted, with capped excerpts.
pub fn synthetic_feedback(report: &VerificationReport) -> String {
    let mut out = String::from("Verification failed. Address the following checks:\n");
    for (level, check) in report.failed_checks() {
        let mut line = format!("- [{level}] {}", check.name);
        if let Some(detail) = &check.detail {
            line.push_str(": ");
            line.push_str(&truncate_chars(detail, MAX_EXCERPT_CHARS));
        }
        line.push('\n');
        if out.len() + line.len() > MAX_FEEDBACK_CHARS {
            out.push_str("- (further failures truncated)\n");
            break;
        }
        out.push_str(&line);
    }
    out
}

/// Truncate to at most `max` bytes on a char boundary, appending "..."
/// when truncated.
fn truncate_chars(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_owned();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    let mut truncated = s[..end].to_owned();
    truncated.push_str("...");
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CheckResult, LevelResult};
    use crate::order::GateLevel;

    fn failing_report() -> VerificationReport {
        VerificationReport {
            id: Uuid::new_v4(),
            passed: false,
            levels: vec![
                LevelResult {
                    level: GateLevel::L1,
                    passed: false,
                    checks: vec![CheckResult {
                        name: "unit_suite".into(),
                        passed: false,
                        detail: Some("assertion failed: left != right".into()),
                    }],
                },
                LevelResult {
                    level: GateLevel::L0,
                    passed: false,
                    checks: vec![CheckResult {
                        name: "contract_shape".into(),
                        passed: false,
                        detail: None,
                    }],
                },
            ],
            diagnostics: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    #[test]
    fn synthetic_feedback_orders_levels_and_names_checks() {
        let feedback = synthetic_feedback(&failing_report());
        let l0 = feedback.find("[L0] contract_shape").expect("L0 entry");
        let l1 = feedback.find("[L1] unit_suite").expect("L1 entry");
        assert!(l0 < l1, "L0 must precede L1:\n{feedback}");
        assert!(feedback.contains("assertion failed"));
    }

    #[test]
    fn synthetic_feedback_caps_excerpts() {
        let mut report = failing_report();
        report.levels[0].checks[0].detail = Some("x".repeat(2_000));
        let feedback = synthetic_feedback(&report);
        // 500-char cap plus the ellipsis.
        assert!(feedback.contains(&format!("{}...", "x".repeat(500))));
        assert!(!feedback.contains(&"x".repeat(501)));
    }

    #[test]
    fn synthetic_feedback_caps_total_size() {
        let mut report = failing_report();
        report.levels[0].checks = (0..100)
            .map(|i| CheckResult {
                name: format!("check_{i}"),
                passed: false,
                detail: Some("y".repeat(400)),
            })
            .collect();
        let feedback = synthetic_feedback(&report);
        assert!(feedback.len() <= 10_100, "feedback too long: {}", feedback.len());
        assert!(feedback.contains("further failures truncated"));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "héllo wörld";
        let out = truncate_chars(s, 2);
        assert!(out.ends_with("..."));
        assert!(out.len() <= 5);
        assert_eq!(truncate_chars("short", 10), "short");
    }
}
