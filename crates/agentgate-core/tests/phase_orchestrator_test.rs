//! Integration tests for the phase pipeline: early exits, feedback
//! fallback, persistence, and session propagation.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use agentgate_core::capability::{Capabilities, DriverRegistry, Snapshotter, Verifier};
use agentgate_core::convergence::StrategyConfig;
use agentgate_core::error::BuildFailureKind;
use agentgate_core::order::GateLevel;
use agentgate_core::phase::{IterationContext, IterationVerdict, PhaseKind, PhaseOrchestrator};

use agentgate_test_utils::{
    execution_input, passing_report, report_with_failures, AgentStep, BrokenFeedback,
    HashingSnapshotter, MemoryPersister, ScriptedDriver, ScriptedVerifier, SharedDriver,
    TemplateFeedback,
};

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

struct PipelineHarness {
    orchestrator: PhaseOrchestrator,
    driver: Arc<ScriptedDriver>,
    verifier: Arc<ScriptedVerifier>,
    persister: Arc<MemoryPersister>,
    snapshotter: Arc<HashingSnapshotter>,
}

fn pipeline(
    driver: ScriptedDriver,
    verifier: ScriptedVerifier,
    snapshotter: HashingSnapshotter,
    broken_feedback: bool,
) -> PipelineHarness {
    let driver = Arc::new(driver);
    let verifier = Arc::new(verifier);
    let persister = Arc::new(MemoryPersister::new());
    let snapshotter = Arc::new(snapshotter);

    let mut registry = DriverRegistry::new();
    registry.register(SharedDriver(Arc::clone(&driver)));

    let caps = Capabilities {
        drivers: Arc::new(registry),
        snapshotter: Arc::clone(&snapshotter) as Arc<dyn agentgate_core::capability::Snapshotter>,
        verifier: Arc::clone(&verifier) as Arc<dyn Verifier>,
        feedback: if broken_feedback {
            Arc::new(BrokenFeedback)
        } else {
            Arc::new(TemplateFeedback)
        },
        persister: Arc::clone(&persister) as Arc<dyn agentgate_core::capability::ResultPersister>,
    };

    PipelineHarness {
        orchestrator: PhaseOrchestrator::new(caps),
        driver,
        verifier,
        persister,
        snapshotter,
    }
}

async fn run_one(harness: &PipelineHarness, workspace: &std::path::Path, iteration: u32) ->
    agentgate_core::phase::IterationOutcome
{
    let input = execution_input(workspace, StrategyConfig::Fixed { max_iterations: 3 });
    let before = harness
        .snapshotter
        .capture_before(workspace)
        .await
        .expect("before state");
    let cancel = CancellationToken::new();
    harness
        .orchestrator
        .run_iteration(IterationContext {
            run_id: Uuid::new_v4(),
            work_order: &input.work_order,
            spec: &input.resolved_spec,
            iteration,
            feedback: None,
            session_id: None,
            before: &before,
            phase_timeout: Duration::from_secs(30),
            cancel: &cancel,
        })
        .await
}

// ---------------------------------------------------------------------------
// Early exits
// ---------------------------------------------------------------------------

#[tokio::test]
async fn build_failure_stops_the_pipeline() {
    let workspace = tempfile::tempdir().unwrap();
    let harness = pipeline(
        ScriptedDriver::new([AgentStep::Fail {
            kind: BuildFailureKind::AgentFailure,
        }]),
        ScriptedVerifier::always_passing(),
        HashingSnapshotter::new(),
        false,
    );

    let outcome = run_one(&harness, workspace.path(), 1).await;

    assert_eq!(
        outcome.verdict,
        IterationVerdict::BuildFailed(BuildFailureKind::AgentFailure)
    );
    assert!(!outcome.success);
    assert!(outcome.snapshot.is_none());
    assert!(outcome.report.is_none());
    assert_eq!(harness.verifier.call_count(), 0);
    // Session id still propagates on failure.
    assert_eq!(outcome.session_id.as_deref(), Some("sess-1"));
    assert!(outcome.timings.build.is_some());
    assert!(outcome.timings.snapshot.is_none());
}

#[tokio::test]
async fn snapshot_failure_stops_before_verify() {
    let workspace = tempfile::tempdir().unwrap();
    let harness = pipeline(
        ScriptedDriver::always_succeeding("edited"),
        ScriptedVerifier::always_passing(),
        HashingSnapshotter::failing_first(1),
        false,
    );

    let outcome = run_one(&harness, workspace.path(), 1).await;

    assert_eq!(outcome.verdict, IterationVerdict::SnapshotFailed);
    assert!(outcome.snapshot.is_none());
    assert_eq!(harness.verifier.call_count(), 0);
    assert!(outcome.timings.snapshot.is_some());
    assert!(outcome.timings.verify.is_none());
    // The agent result was still persisted.
    assert_eq!(harness.persister.agent_result_count(), 1);
}

// ---------------------------------------------------------------------------
// Verify outcomes and feedback
// ---------------------------------------------------------------------------

#[tokio::test]
async fn verify_pass_skips_feedback_entirely() {
    let workspace = tempfile::tempdir().unwrap();
    std::fs::write(workspace.path().join("lib.rs"), "pub fn f() {}").unwrap();
    let harness = pipeline(
        ScriptedDriver::always_succeeding("done"),
        ScriptedVerifier::always_passing(),
        HashingSnapshotter::new(),
        false,
    );

    let outcome = run_one(&harness, workspace.path(), 1).await;

    assert_eq!(outcome.verdict, IterationVerdict::VerifyPassed);
    assert!(outcome.success);
    assert!(outcome.feedback.is_none());
    assert!(outcome.timings.feedback.is_none());
    assert!(outcome.snapshot.is_some());
    assert_eq!(harness.persister.verification_count(), 1);

    // The snapshot fingerprint is the post-tree hash.
    let snapshot = outcome.snapshot.unwrap();
    assert_eq!(snapshot.fingerprint.as_deref(), Some(snapshot.post_hash.as_str()));
}

#[tokio::test]
async fn verify_failure_produces_generator_feedback() {
    let workspace = tempfile::tempdir().unwrap();
    let harness = pipeline(
        ScriptedDriver::always_succeeding("working"),
        ScriptedVerifier::always_failing(GateLevel::L2),
        HashingSnapshotter::new(),
        false,
    );

    let outcome = run_one(&harness, workspace.path(), 1).await;

    assert_eq!(outcome.verdict, IterationVerdict::VerifyFailedRetryable);
    assert!(!outcome.success);
    assert!(!outcome.fallback_feedback);
    let feedback = outcome.feedback.as_deref().unwrap();
    assert!(feedback.contains("L2"), "feedback should name the level: {feedback}");
    assert!(outcome.timings.feedback.is_some());
}

#[tokio::test]
async fn feedback_phase_never_fails() {
    let workspace = tempfile::tempdir().unwrap();
    let harness = pipeline(
        ScriptedDriver::always_succeeding("working"),
        ScriptedVerifier::new([report_with_failures(&[GateLevel::L0, GateLevel::L3])]),
        HashingSnapshotter::new(),
        true,
    );

    let outcome = run_one(&harness, workspace.path(), 1).await;

    // The generator is broken, but the phase still succeeds with
    // synthetic feedback, in level order.
    assert_eq!(outcome.verdict, IterationVerdict::VerifyFailedRetryable);
    assert!(outcome.fallback_feedback);
    let feedback = outcome.feedback.as_deref().unwrap();
    let l0 = feedback.find("[L0]").expect("L0 entry");
    let l3 = feedback.find("[L3]").expect("L3 entry");
    assert!(l0 < l3);
}

#[tokio::test]
async fn driver_results_are_persisted_per_iteration() {
    let workspace = tempfile::tempdir().unwrap();
    let harness = pipeline(
        ScriptedDriver::always_succeeding("working"),
        ScriptedVerifier::new([report_with_failures(&[GateLevel::L1]), passing_report()]),
        HashingSnapshotter::new(),
        false,
    );

    let first = run_one(&harness, workspace.path(), 1).await;
    let second = run_one(&harness, workspace.path(), 2).await;

    assert_eq!(first.verdict, IterationVerdict::VerifyFailedRetryable);
    assert_eq!(second.verdict, IterationVerdict::VerifyPassed);
    assert_eq!(harness.persister.agent_result_count(), 2);
    assert_eq!(harness.persister.verification_count(), 2);
    assert_eq!(harness.driver.invocation_count(), 2);
}

#[tokio::test]
async fn cancelled_token_short_circuits_between_phases() {
    let workspace = tempfile::tempdir().unwrap();
    let harness = pipeline(
        ScriptedDriver::always_succeeding("working"),
        ScriptedVerifier::always_passing(),
        HashingSnapshotter::new(),
        false,
    );

    let input = execution_input(workspace.path(), StrategyConfig::Fixed { max_iterations: 3 });
    let before = harness
        .snapshotter
        .capture_before(workspace.path())
        .await
        .unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = harness
        .orchestrator
        .run_iteration(IterationContext {
            run_id: Uuid::new_v4(),
            work_order: &input.work_order,
            spec: &input.resolved_spec,
            iteration: 1,
            feedback: None,
            session_id: None,
            before: &before,
            phase_timeout: Duration::from_secs(30),
            cancel: &cancel,
        })
        .await;

    // Build ran to completion; the boundary check then stopped the
    // pipeline before snapshot.
    assert_eq!(outcome.verdict, IterationVerdict::Cancelled);
    assert_eq!(harness.verifier.call_count(), 0);
}

#[tokio::test]
async fn missing_driver_is_an_internal_error() {
    let workspace = tempfile::tempdir().unwrap();
    let persister = Arc::new(MemoryPersister::new());
    let caps = Capabilities {
        drivers: Arc::new(DriverRegistry::new()),
        snapshotter: Arc::new(HashingSnapshotter::new()),
        verifier: Arc::new(ScriptedVerifier::always_passing()),
        feedback: Arc::new(TemplateFeedback),
        persister,
    };
    let orchestrator = PhaseOrchestrator::new(caps);

    let input = execution_input(workspace.path(), StrategyConfig::Fixed { max_iterations: 3 });
    let before = HashingSnapshotter::new()
        .capture_before(workspace.path())
        .await
        .unwrap();
    let cancel = CancellationToken::new();

    let outcome = orchestrator
        .run_iteration(IterationContext {
            run_id: Uuid::new_v4(),
            work_order: &input.work_order,
            spec: &input.resolved_spec,
            iteration: 1,
            feedback: None,
            session_id: None,
            before: &before,
            phase_timeout: Duration::from_secs(30),
            cancel: &cancel,
        })
        .await;

    assert_eq!(outcome.verdict, IterationVerdict::InternalError(PhaseKind::Build));
}
