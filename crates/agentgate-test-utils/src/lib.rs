//! Shared test utilities for agentgate integration tests.
//!
//! Provides scripted in-memory implementations of the five capability
//! interfaces plus an event collector, so engine and control-plane
//! tests can run entirely in-process: a [`ScriptedDriver`] that plays
//! back per-iteration agent outcomes, a [`HashingSnapshotter`] that
//! fingerprints a real temp directory, a [`ScriptedVerifier`], a
//! feedback generator that can be forced to fail (exercising the
//! synthetic fallback), and a [`MemoryPersister`].

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use agentgate_core::capability::snapshot::BeforeState;
use agentgate_core::capability::{
    AgentDriver, AgentRequest, AgentResult, Capabilities, CheckResult, DriverRegistry,
    FeedbackContext, FeedbackGenerator, LevelResult, ResultPersister, Snapshot, Snapshotter,
    VerificationReport, Verifier, VerifyRequest,
};
use agentgate_core::convergence::StrategyConfig;
use agentgate_core::error::BuildFailureKind;
use agentgate_core::events::{EngineEvent, EventBus};
use agentgate_core::order::{
    GateLevel, GatePlan, GatePlanSource, ResolvedTaskSpec, WorkOrder, WorkspaceSource,
};
use agentgate_core::ExecutionInput;

// ---------------------------------------------------------------------------
// Scripted agent driver
// ---------------------------------------------------------------------------

/// One scripted agent invocation.
#[derive(Debug, Clone)]
pub enum AgentStep {
    /// Succeed with the given stdout.
    Succeed { stdout: String },
    /// Report a failure of the given kind.
    Fail { kind: BuildFailureKind },
    /// Return an error from the driver itself.
    Crash { message: String },
    /// Sleep for the given duration before succeeding, to trip
    /// timeouts under paused tokio time.
    Stall { duration: Duration },
}

/// What the driver observed about each invocation, for assertions.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub iteration: u32,
    pub feedback: Option<String>,
    pub session_id: Option<String>,
}

/// Plays back a script of agent outcomes and mints session ids
/// (`sess-1`, `sess-2`, ...) per invocation.
pub struct ScriptedDriver {
    script: Mutex<VecDeque<AgentStep>>,
    seen: Mutex<Vec<SeenRequest>>,
    invocations: Mutex<u32>,
}

impl ScriptedDriver {
    pub fn new(steps: impl IntoIterator<Item = AgentStep>) -> Self {
        Self {
            script: Mutex::new(steps.into_iter().collect()),
            seen: Mutex::new(Vec::new()),
            invocations: Mutex::new(0),
        }
    }

    /// A driver that always succeeds with the given stdout.
    pub fn always_succeeding(stdout: &str) -> Self {
        Self::new([AgentStep::Succeed {
            stdout: stdout.to_owned(),
        }])
    }

    pub fn seen_requests(&self) -> Vec<SeenRequest> {
        self.seen.lock().unwrap().clone()
    }

    pub fn invocation_count(&self) -> u32 {
        *self.invocations.lock().unwrap()
    }
}

#[async_trait]
impl AgentDriver for ScriptedDriver {
    fn kind(&self) -> &str {
        "scripted"
    }

    async fn execute(&self, request: AgentRequest) -> Result<AgentResult> {
        self.seen.lock().unwrap().push(SeenRequest {
            iteration: request.iteration,
            feedback: request.feedback.clone(),
            session_id: request.session_id.clone(),
        });
        let invocation = {
            let mut n = self.invocations.lock().unwrap();
            *n += 1;
            *n
        };

        // Consume the next step; the last one repeats forever.
        let step = {
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.pop_front().unwrap()
            } else {
                script
                    .front()
                    .cloned()
                    .unwrap_or(AgentStep::Succeed {
                        stdout: String::new(),
                    })
            }
        };

        let session_id = Some(format!("sess-{invocation}"));
        let ok = |stdout: String| AgentResult {
            success: true,
            session_id: session_id.clone(),
            stdout,
            stderr: String::new(),
            duration: Duration::from_millis(5),
            tokens_used: Some(1_000),
            failure: None,
        };

        match step {
            AgentStep::Succeed { stdout } => Ok(ok(stdout)),
            AgentStep::Fail { kind } => Ok(AgentResult {
                success: false,
                session_id: session_id.clone(),
                stdout: String::new(),
                stderr: format!("agent failed: {kind}"),
                duration: Duration::from_millis(5),
                tokens_used: Some(200),
                failure: Some(kind),
            }),
            AgentStep::Crash { message } => Err(anyhow::anyhow!(message)),
            AgentStep::Stall { duration } => {
                tokio::select! {
                    _ = tokio::time::sleep(duration) => Ok(ok(String::new())),
                    _ = request.cancel.cancelled() => Ok(ok(String::new())),
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Hashing snapshotter
// ---------------------------------------------------------------------------

/// Captures real content hashes of a workspace directory, so loop
/// detection sees identical fingerprints when the tree does not
/// change. Can be scripted to fail the first N captures.
pub struct HashingSnapshotter {
    failures_remaining: Mutex<u32>,
}

impl HashingSnapshotter {
    pub fn new() -> Self {
        Self {
            failures_remaining: Mutex::new(0),
        }
    }

    /// Fail the first `n` `capture` calls with an error.
    pub fn failing_first(n: u32) -> Self {
        Self {
            failures_remaining: Mutex::new(n),
        }
    }
}

impl Default for HashingSnapshotter {
    fn default() -> Self {
        Self::new()
    }
}

/// Stable digest of every file path + content under `root`.
fn hash_tree(root: &Path) -> Result<String> {
    fn walk(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
        for entry in std::fs::read_dir(dir)
            .with_context(|| format!("failed to read {}", dir.display()))?
        {
            let path = entry?.path();
            if path.is_dir() {
                walk(&path, files)?;
            } else {
                files.push(path);
            }
        }
        Ok(())
    }

    let mut files = Vec::new();
    if root.exists() {
        walk(root, &mut files)?;
    }
    files.sort();

    let mut hasher = Sha256::new();
    for file in files {
        hasher.update(file.to_string_lossy().as_bytes());
        hasher.update(std::fs::read(&file).with_context(|| format!("read {}", file.display()))?);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[async_trait]
impl Snapshotter for HashingSnapshotter {
    async fn capture_before(&self, workspace: &Path) -> Result<BeforeState> {
        Ok(BeforeState {
            content_hash: hash_tree(workspace)?,
            captured_at: Utc::now(),
        })
    }

    async fn capture(
        &self,
        workspace: &Path,
        before: &BeforeState,
        run_id: Uuid,
        iteration: u32,
        _prompt: &str,
    ) -> Result<Snapshot> {
        {
            let mut remaining = self.failures_remaining.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                anyhow::bail!("scripted snapshot failure");
            }
        }
        let post_hash = hash_tree(workspace)?;
        Ok(Snapshot {
            id: Uuid::new_v4(),
            pre_hash: before.content_hash.clone(),
            post_hash: post_hash.clone(),
            files_added: 0,
            files_modified: usize::from(post_hash != before.content_hash),
            files_removed: 0,
            patch_ref: format!("runs/{run_id}/iterations/{iteration}/patch"),
            fingerprint: Some(post_hash),
        })
    }
}

// ---------------------------------------------------------------------------
// Scripted verifier
// ---------------------------------------------------------------------------

/// Build a report where every level in the plan passes.
pub fn passing_report() -> VerificationReport {
    report_with_failures(&[])
}

/// Build a report failing exactly the given levels (all four levels
/// are present).
pub fn report_with_failures(failed: &[GateLevel]) -> VerificationReport {
    let levels: Vec<LevelResult> = GateLevel::ALL
        .iter()
        .map(|level| {
            let passed = !failed.contains(level);
            LevelResult {
                level: *level,
                passed,
                checks: vec![CheckResult {
                    name: format!("{level}_suite"),
                    passed,
                    detail: (!passed).then(|| format!("{level} checks failed")),
                }],
            }
        })
        .collect();
    VerificationReport {
        id: Uuid::new_v4(),
        passed: failed.is_empty(),
        levels,
        diagnostics: Vec::new(),
        duration: Duration::from_millis(20),
    }
}

/// Plays back a script of verification reports; the last one repeats.
pub struct ScriptedVerifier {
    script: Mutex<VecDeque<VerificationReport>>,
    calls: Mutex<u32>,
}

impl ScriptedVerifier {
    pub fn new(reports: impl IntoIterator<Item = VerificationReport>) -> Self {
        Self {
            script: Mutex::new(reports.into_iter().collect()),
            calls: Mutex::new(0),
        }
    }

    pub fn always_passing() -> Self {
        Self::new([passing_report()])
    }

    pub fn always_failing(level: GateLevel) -> Self {
        Self::new([report_with_failures(&[level])])
    }

    pub fn call_count(&self) -> u32 {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl Verifier for ScriptedVerifier {
    async fn verify(&self, _request: VerifyRequest) -> Result<VerificationReport> {
        *self.calls.lock().unwrap() += 1;
        let mut script = self.script.lock().unwrap();
        let report = if script.len() > 1 {
            script.pop_front().unwrap()
        } else {
            script.front().cloned().unwrap_or_else(passing_report)
        };
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Feedback generators
// ---------------------------------------------------------------------------

/// Formats a short deterministic feedback string.
pub struct TemplateFeedback;

#[async_trait]
impl FeedbackGenerator for TemplateFeedback {
    async fn generate(
        &self,
        _snapshot: &Snapshot,
        report: &VerificationReport,
        _gate_plan: &GatePlan,
        ctx: &FeedbackContext,
    ) -> Result<String> {
        let failed: Vec<String> = report
            .levels
            .iter()
            .filter(|l| !l.passed)
            .map(|l| l.level.to_string())
            .collect();
        Ok(format!(
            "iteration {}: fix failing levels [{}]",
            ctx.iteration,
            failed.join(", ")
        ))
    }
}

/// Always errors, forcing the orchestrator's synthetic fallback.
pub struct BrokenFeedback;

#[async_trait]
impl FeedbackGenerator for BrokenFeedback {
    async fn generate(
        &self,
        _snapshot: &Snapshot,
        _report: &VerificationReport,
        _gate_plan: &GatePlan,
        _ctx: &FeedbackContext,
    ) -> Result<String> {
        anyhow::bail!("feedback model unavailable")
    }
}

// ---------------------------------------------------------------------------
// In-memory persister
// ---------------------------------------------------------------------------

/// Records what the engine asked to persist.
#[derive(Default)]
pub struct MemoryPersister {
    agent_results: Mutex<HashMap<(Uuid, u32), AgentResult>>,
    verifications: Mutex<HashMap<(Uuid, u32), VerificationReport>>,
}

impl MemoryPersister {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn agent_result_count(&self) -> usize {
        self.agent_results.lock().unwrap().len()
    }

    pub fn verification_count(&self) -> usize {
        self.verifications.lock().unwrap().len()
    }
}

#[async_trait]
impl ResultPersister for MemoryPersister {
    async fn save_agent_result(
        &self,
        run_id: Uuid,
        iteration: u32,
        result: &AgentResult,
    ) -> Result<()> {
        self.agent_results
            .lock()
            .unwrap()
            .insert((run_id, iteration), result.clone());
        Ok(())
    }

    async fn save_verification(
        &self,
        run_id: Uuid,
        iteration: u32,
        report: &VerificationReport,
    ) -> Result<()> {
        self.verifications
            .lock()
            .unwrap()
            .insert((run_id, iteration), report.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Capability bundles and inputs
// ---------------------------------------------------------------------------

/// Bundle a driver + verifier (and defaults for the rest) into a
/// capability set.
pub fn capabilities(
    driver: ScriptedDriver,
    verifier: ScriptedVerifier,
) -> (Capabilities, Arc<ScriptedDriver>, Arc<ScriptedVerifier>) {
    capabilities_with(driver, verifier, HashingSnapshotter::new(), TemplateFeedback)
}

/// Like [`capabilities`] but with explicit snapshotter and feedback.
pub fn capabilities_with(
    driver: ScriptedDriver,
    verifier: ScriptedVerifier,
    snapshotter: HashingSnapshotter,
    feedback: impl FeedbackGenerator + 'static,
) -> (Capabilities, Arc<ScriptedDriver>, Arc<ScriptedVerifier>) {
    let driver = Arc::new(driver);
    let verifier = Arc::new(verifier);
    let mut registry = DriverRegistry::new();
    registry.register(SharedDriver(Arc::clone(&driver)));
    let caps = Capabilities {
        drivers: Arc::new(registry),
        snapshotter: Arc::new(snapshotter),
        verifier: Arc::clone(&verifier) as Arc<dyn Verifier>,
        feedback: Arc::new(feedback),
        persister: Arc::new(MemoryPersister::new()),
    };
    (caps, driver, verifier)
}

/// Adapter so a shared [`ScriptedDriver`] can live in the registry
/// while the test keeps a handle for assertions.
pub struct SharedDriver(pub Arc<ScriptedDriver>);

#[async_trait]
impl AgentDriver for SharedDriver {
    fn kind(&self) -> &str {
        self.0.kind()
    }

    async fn execute(&self, request: AgentRequest) -> Result<AgentResult> {
        self.0.execute(request).await
    }
}

/// A work order plus resolved spec pointing at a temp workspace.
pub fn execution_input(workspace: &Path, convergence: StrategyConfig) -> ExecutionInput {
    let mut order = WorkOrder::new(
        "implement the feature and make the gates pass",
        WorkspaceSource::Local {
            path: workspace.to_path_buf(),
        },
    );
    order.agent_kind = "scripted".to_owned();
    ExecutionInput {
        work_order: order.clone(),
        resolved_spec: ResolvedTaskSpec {
            task_prompt: order.task_prompt.clone(),
            workspace_path: workspace.to_path_buf(),
            gate_plan: GatePlan::standard(),
            gate_plan_origin: GatePlanSource::Default,
            convergence,
        },
        lease_id: None,
    }
}

// ---------------------------------------------------------------------------
// Event collection
// ---------------------------------------------------------------------------

/// Subscribes to the bus and records everything it sees.
pub struct EventCollector {
    events: Arc<Mutex<Vec<EngineEvent>>>,
    _handle: tokio::task::JoinHandle<()>,
}

impl EventCollector {
    pub fn attach(bus: &EventBus) -> Self {
        let events: Arc<Mutex<Vec<EngineEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let mut rx = bus.subscribe();
        let handle = tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                sink.lock().unwrap().push(event);
            }
        });
        Self {
            events,
            _handle: handle,
        }
    }

    pub fn snapshot(&self) -> Vec<EngineEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Wait until an event matching `pred` has been seen.
    pub async fn wait_for(&self, mut pred: impl FnMut(&EngineEvent) -> bool, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.events.lock().unwrap().iter().any(&mut pred) {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("event not observed within {timeout:?}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
