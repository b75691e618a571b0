//! End-to-end tests through the assembled control plane: submit ->
//! claim -> run -> terminal, retry backoff re-enqueues, cancellation
//! in every lifecycle stage, and backpressure at the submit surface.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use agentgate_core::capability::Capabilities;
use agentgate_core::config::AgentGateConfig;
use agentgate_core::control::ControlPlane;
use agentgate_core::convergence::StrategyConfig;
use agentgate_core::error::{BuildFailureKind, EngineError};
use agentgate_core::events::EngineEvent;
use agentgate_core::order::GateLevel;
use agentgate_core::state::OrderState;

use agentgate_test_utils::{
    capabilities, execution_input, AgentStep, EventCollector, ScriptedDriver, ScriptedVerifier,
};

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

/// Fast scheduler/retry timings so paused-clock tests converge
/// quickly. Memory thresholds are disabled so host memory usage never
/// stalls claims.
fn fast_config() -> AgentGateConfig {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let mut cfg = AgentGateConfig::default();
    cfg.scheduler.poll_interval_ms = 20;
    cfg.scheduler.stagger_delay_ms = 5;
    cfg.resources.max_slots = Some(2);
    cfg.resources.memory_warning_ratio = 1.0;
    cfg.resources.memory_critical_ratio = 1.1;
    cfg
}

fn plane_with(cfg: AgentGateConfig, caps: Capabilities) -> Arc<ControlPlane> {
    ControlPlane::new(cfg, caps)
}

/// Poll for a state under the paused clock. The generous budget is
/// virtual time: backoff scenarios fast-forward through tens of
/// seconds of delays.
async fn wait_for_state(plane: &ControlPlane, order_id: Uuid, state: OrderState) {
    for _ in 0..20_000 {
        if plane.order_state(order_id) == Some(state) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "order {order_id} never reached {state}, currently {:?}",
        plane.order_state(order_id)
    );
}

// ---------------------------------------------------------------------------
// Happy path
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn submit_runs_to_completion() {
    let workspace = tempfile::tempdir().unwrap();
    std::fs::write(workspace.path().join("main.rs"), "fn main() {}").unwrap();

    let (caps, _driver, _verifier) = capabilities(
        ScriptedDriver::always_succeeding("feature implemented"),
        ScriptedVerifier::always_passing(),
    );
    let plane = plane_with(fast_config(), caps);
    let collector = EventCollector::attach(plane.bus());

    let input = execution_input(workspace.path(), StrategyConfig::Fixed { max_iterations: 3 });
    let order_id = plane.submit(input).unwrap();

    wait_for_state(&plane, order_id, OrderState::Completed).await;
    assert_eq!(plane.active_runs(), 0);

    collector
        .wait_for(
            |e| matches!(e, EngineEvent::RunCompleted { .. }),
            Duration::from_secs(5),
        )
        .await;

    plane.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn duplicate_submit_is_rejected() {
    let workspace = tempfile::tempdir().unwrap();
    let (caps, _driver, _verifier) = capabilities(
        ScriptedDriver::always_succeeding("ok"),
        ScriptedVerifier::always_passing(),
    );
    let plane = plane_with(fast_config(), caps);

    let input = execution_input(workspace.path(), StrategyConfig::Fixed { max_iterations: 3 });
    let order_id = plane.submit(input.clone()).unwrap();
    let err = plane.submit(input).unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    wait_for_state(&plane, order_id, OrderState::Completed).await;
    plane.shutdown().await;
}

// ---------------------------------------------------------------------------
// Scenario E: timeout retried with backoff until the budget is spent
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn agent_timeout_retries_with_backoff_then_fails() {
    let workspace = tempfile::tempdir().unwrap();

    let (caps, driver, _verifier) = capabilities(
        ScriptedDriver::new([AgentStep::Fail {
            kind: BuildFailureKind::AgentTimeout,
        }]),
        ScriptedVerifier::always_passing(),
    );
    let plane = plane_with(fast_config(), caps);
    let collector = EventCollector::attach(plane.bus());

    let input = execution_input(workspace.path(), StrategyConfig::Fixed { max_iterations: 3 });
    let order_id = plane.submit(input).unwrap();

    // Attempt 1 fails -> waiting_retry -> backoff -> pending -> ...
    // until retry_count == max_retries (3), then the next failure is
    // terminal.
    wait_for_state(&plane, order_id, OrderState::Failed).await;

    let events = collector.snapshot();
    let waiting_retries = events
        .iter()
        .filter(|e| {
            matches!(
                e,
                EngineEvent::StateChanged { to: OrderState::WaitingRetry, .. }
            )
        })
        .count();
    let claims = events
        .iter()
        .filter(|e| matches!(e, EngineEvent::WorkClaimed { .. }))
        .count();
    assert_eq!(waiting_retries, 3, "three parked retries before failing");
    assert_eq!(claims, 4, "initial attempt plus three retries");
    assert_eq!(driver.invocation_count(), 4);
    assert_eq!(plane.retries().stats().pending, 0);

    plane.shutdown().await;
}

// ---------------------------------------------------------------------------
// Backpressure at the submit surface (scenario F)
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn submit_backpressure_rejects_without_retaining() {
    let workspace = tempfile::tempdir().unwrap();

    let (caps, _driver, _verifier) = capabilities(
        ScriptedDriver::always_succeeding("ok"),
        ScriptedVerifier::always_passing(),
    );
    let mut cfg = fast_config();
    cfg.scheduler.max_queue_depth = 2;
    cfg.resources.max_slots = Some(1);
    let plane = plane_with(cfg, caps);

    // Occupy the only slot so nothing is claimed while we fill the
    // queue.
    let held = plane.monitor().acquire_slot(Uuid::new_v4()).unwrap();

    let w1 = execution_input(workspace.path(), StrategyConfig::Fixed { max_iterations: 3 });
    let w2 = execution_input(workspace.path(), StrategyConfig::Fixed { max_iterations: 3 });
    let w3 = execution_input(workspace.path(), StrategyConfig::Fixed { max_iterations: 3 });
    let w3_id = w3.work_order.id;

    plane.submit(w1).unwrap();
    plane.submit(w2).unwrap();
    let err = plane.submit(w3).unwrap_err();
    assert!(matches!(err, EngineError::Backpressure { depth: 2 }));

    // The rejected order left no trace: it can be resubmitted later.
    assert_eq!(plane.order_state(w3_id), None);
    assert_eq!(plane.scheduler().depth(), 2);

    plane.monitor().release_slot(&held);
    plane.shutdown().await;
}

// ---------------------------------------------------------------------------
// Cancellation across lifecycle stages
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn cancel_pending_order_removes_it_from_the_queue() {
    let workspace = tempfile::tempdir().unwrap();
    let (caps, _driver, _verifier) = capabilities(
        ScriptedDriver::always_succeeding("ok"),
        ScriptedVerifier::always_passing(),
    );
    let mut cfg = fast_config();
    cfg.resources.max_slots = Some(1);
    let plane = plane_with(cfg, caps);

    // Hold the slot so the order stays pending.
    let _held = plane.monitor().acquire_slot(Uuid::new_v4()).unwrap();

    let input = execution_input(workspace.path(), StrategyConfig::Fixed { max_iterations: 3 });
    let order_id = plane.submit(input).unwrap();
    assert_eq!(plane.order_state(order_id), Some(OrderState::Pending));

    plane.cancel(order_id, "no longer needed").unwrap();
    assert_eq!(plane.order_state(order_id), Some(OrderState::Cancelled));
    assert_eq!(plane.scheduler().depth(), 0);

    // Cancelling again succeeds with no state change.
    plane.cancel(order_id, "again").unwrap();
    assert_eq!(plane.order_state(order_id), Some(OrderState::Cancelled));

    plane.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn cancel_waiting_retry_disarms_the_timer() {
    let workspace = tempfile::tempdir().unwrap();
    let (caps, driver, _verifier) = capabilities(
        ScriptedDriver::new([AgentStep::Fail {
            kind: BuildFailureKind::AgentTimeout,
        }]),
        ScriptedVerifier::always_passing(),
    );
    let plane = plane_with(fast_config(), caps);

    let input = execution_input(workspace.path(), StrategyConfig::Fixed { max_iterations: 3 });
    let order_id = plane.submit(input).unwrap();

    wait_for_state(&plane, order_id, OrderState::WaitingRetry).await;
    let invocations = driver.invocation_count();
    assert_eq!(plane.retries().stats().pending, 1);

    plane.cancel(order_id, "give up").unwrap();
    assert_eq!(plane.order_state(order_id), Some(OrderState::Cancelled));
    assert_eq!(plane.retries().stats().pending, 0);

    // Long past every backoff bound: the disarmed timer must not
    // re-run the agent.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(driver.invocation_count(), invocations);

    plane.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn cancel_running_order_cancels_cooperatively() {
    let workspace = tempfile::tempdir().unwrap();
    let (caps, _driver, _verifier) = capabilities(
        ScriptedDriver::new([AgentStep::Stall {
            duration: Duration::from_secs(3_600),
        }]),
        ScriptedVerifier::always_passing(),
    );
    let plane = plane_with(fast_config(), caps);
    let collector = EventCollector::attach(plane.bus());

    let input = execution_input(workspace.path(), StrategyConfig::Fixed { max_iterations: 3 });
    let order_id = plane.submit(input).unwrap();

    collector
        .wait_for(
            |e| matches!(e, EngineEvent::RunStarted { .. }),
            Duration::from_secs(30),
        )
        .await;

    plane.cancel(order_id, "operator stop").unwrap();
    wait_for_state(&plane, order_id, OrderState::Cancelled).await;
    assert_eq!(plane.active_runs(), 0);

    collector
        .wait_for(
            |e| matches!(e, EngineEvent::RunCanceled { .. }),
            Duration::from_secs(5),
        )
        .await;

    plane.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn cancel_unknown_order_is_an_error() {
    let (caps, _driver, _verifier) = capabilities(
        ScriptedDriver::always_succeeding("ok"),
        ScriptedVerifier::always_passing(),
    );
    let plane = plane_with(fast_config(), caps);
    let err = plane.cancel(Uuid::new_v4(), "nothing there").unwrap_err();
    assert!(matches!(err, EngineError::UnknownOrder(_)));
    plane.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn cancel_completed_order_is_a_noop() {
    let workspace = tempfile::tempdir().unwrap();
    let (caps, _driver, _verifier) = capabilities(
        ScriptedDriver::always_succeeding("ok"),
        ScriptedVerifier::always_passing(),
    );
    let plane = plane_with(fast_config(), caps);

    let input = execution_input(workspace.path(), StrategyConfig::Fixed { max_iterations: 3 });
    let order_id = plane.submit(input).unwrap();
    wait_for_state(&plane, order_id, OrderState::Completed).await;

    plane.cancel(order_id, "too late").unwrap();
    assert_eq!(plane.order_state(order_id), Some(OrderState::Completed));

    plane.shutdown().await;
}

// ---------------------------------------------------------------------------
// Verification-failure loop through the full stack (scenario B shape)
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn verify_failure_iterates_through_the_full_stack() {
    let workspace = tempfile::tempdir().unwrap();
    let (caps, driver, _verifier) = capabilities(
        ScriptedDriver::always_succeeding("iterating"),
        ScriptedVerifier::new([
            agentgate_test_utils::report_with_failures(&[GateLevel::L1]),
            agentgate_test_utils::passing_report(),
        ]),
    );
    let plane = plane_with(fast_config(), caps);

    let input = execution_input(workspace.path(), StrategyConfig::Fixed { max_iterations: 5 });
    let order_id = plane.submit(input).unwrap();

    wait_for_state(&plane, order_id, OrderState::Completed).await;

    let seen = driver.seen_requests();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[1].session_id.as_deref(), Some("sess-1"));
    assert!(seen[1].feedback.as_deref().unwrap_or_default().contains("L1"));

    plane.shutdown().await;
}

// ---------------------------------------------------------------------------
// Health surface
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn health_reports_all_components() {
    let (caps, _driver, _verifier) = capabilities(
        ScriptedDriver::always_succeeding("ok"),
        ScriptedVerifier::always_passing(),
    );
    let plane = plane_with(fast_config(), caps);

    let report = plane.health();
    let names: Vec<&str> = report.components.iter().map(|c| c.name.as_str()).collect();
    assert!(names.contains(&"scheduler"));
    assert!(names.contains(&"resources"));
    assert!(names.contains(&"retries"));
    assert!(names.contains(&"orders"));

    plane.shutdown().await;
}
