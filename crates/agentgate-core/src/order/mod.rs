//! Work orders and the gate model.
//!
//! A [`WorkOrder`] is the immutable, accepted form of a request: what to
//! build, where the workspace comes from, which gates define "done", and
//! the budgets the run must respect. Orders are immutable after
//! acceptance; all mutable execution state lives in the state machine
//! and the run.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::convergence::StrategyConfig;

// ---------------------------------------------------------------------------
// Gate model
// ---------------------------------------------------------------------------

/// Verification level, from contract checks up to full CI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateLevel {
    /// L0: contract / smoke checks.
    L0,
    /// L1: unit tests.
    L1,
    /// L2: integration / blackbox tests.
    L2,
    /// L3: full CI pipeline.
    L3,
}

impl GateLevel {
    /// All levels in ascending order.
    pub const ALL: [GateLevel; 4] = [Self::L0, Self::L1, Self::L2, Self::L3];
}

impl fmt::Display for GateLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::L0 => "L0",
            Self::L1 => "L1",
            Self::L2 => "L2",
            Self::L3 => "L3",
        };
        f.write_str(s)
    }
}

impl FromStr for GateLevel {
    type Err = GateLevelParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "L0" | "l0" => Ok(Self::L0),
            "L1" | "l1" => Ok(Self::L1),
            "L2" | "l2" => Ok(Self::L2),
            "L3" | "l3" => Ok(Self::L3),
            other => Err(GateLevelParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`GateLevel`] string.
#[derive(Debug, Clone)]
pub struct GateLevelParseError(pub String);

impl fmt::Display for GateLevelParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid gate level: {:?}", self.0)
    }
}

impl std::error::Error for GateLevelParseError {}

/// A single gate: a named group of verification levels that must pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gate {
    pub name: String,
    /// The verification levels this gate covers.
    pub levels: Vec<GateLevel>,
}

/// The full set of gates defining "done" for a work order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatePlan {
    pub gates: Vec<Gate>,
    /// Levels the verifier should skip entirely.
    #[serde(default)]
    pub skip_levels: Vec<GateLevel>,
}

impl GatePlan {
    /// A plan with one gate per level L0..L3, the usual default.
    pub fn standard() -> Self {
        Self {
            gates: GateLevel::ALL
                .iter()
                .map(|level| Gate {
                    name: format!("{level}"),
                    levels: vec![*level],
                })
                .collect(),
            skip_levels: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }
}

/// Where the gate plan for an order comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GatePlanSource {
    /// An explicit profile file.
    Profile { path: PathBuf },
    /// Parsed from the workspace's CI configuration.
    CiInferred,
    /// Try profile, then CI, then default.
    Auto,
    /// The built-in default plan.
    Default,
}

impl fmt::Display for GatePlanSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Profile { .. } => "profile",
            Self::CiInferred => "ci-inferred",
            Self::Auto => "auto",
            Self::Default => "default",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Work orders
// ---------------------------------------------------------------------------

/// Where the source workspace comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkspaceSource {
    /// An existing directory on the host.
    Local { path: PathBuf },
    /// An existing git repository.
    GitRepo { url: String, reference: String },
    /// A fresh workspace instantiated from a named template.
    Template { name: String },
}

/// Execution budgets for a work order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLimits {
    /// Maximum number of iterations a run may attempt.
    pub max_iterations: u32,
    /// Wall-clock budget for a run, in milliseconds.
    pub max_wall_clock_ms: u64,
}

impl OrderLimits {
    pub fn max_wall_clock(&self) -> Duration {
        Duration::from_millis(self.max_wall_clock_ms)
    }
}

impl Default for OrderLimits {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            // 30 minutes.
            max_wall_clock_ms: 30 * 60 * 1000,
        }
    }
}

/// Sandbox policies the agent driver must enforce.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPolicies {
    pub network_allowed: bool,
    /// Glob patterns the agent may touch. Empty means unrestricted.
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    /// Glob patterns the agent must not touch.
    #[serde(default)]
    pub forbidden_paths: Vec<String>,
    /// Maximum workspace disk usage in bytes, if bounded.
    pub max_disk_bytes: Option<u64>,
}

/// An accepted request to run an agent against a workspace.
///
/// Immutable after acceptance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkOrder {
    pub id: Uuid,
    pub task_prompt: String,
    pub workspace: WorkspaceSource,
    /// Selects the agent driver from the registry.
    pub agent_kind: String,
    pub limits: OrderLimits,
    pub gate_plan_source: GatePlanSource,
    pub policies: ExecutionPolicies,
    /// Scheduling priority; higher claims first when priority
    /// scheduling is enabled.
    #[serde(default)]
    pub priority: i32,
    pub submitted_at: DateTime<Utc>,
}

impl WorkOrder {
    /// Build an order with defaults for everything but the essentials.
    pub fn new(task_prompt: impl Into<String>, workspace: WorkspaceSource) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_prompt: task_prompt.into(),
            workspace,
            agent_kind: "default".to_owned(),
            limits: OrderLimits::default(),
            gate_plan_source: GatePlanSource::Default,
            policies: ExecutionPolicies::default(),
            priority: 0,
            submitted_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Resolved task spec / execution input
// ---------------------------------------------------------------------------

/// The caller-resolved execution context for a work order.
///
/// Gate-plan resolution and workspace acquisition happen before the
/// engine sees the order; the engine only validates that both are
/// present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedTaskSpec {
    /// The fully resolved task prompt handed to the agent.
    pub task_prompt: String,
    /// Host path of the acquired workspace.
    pub workspace_path: PathBuf,
    pub gate_plan: GatePlan,
    /// Where the gate plan came from, for reporting.
    pub gate_plan_origin: GatePlanSource,
    /// Convergence strategy for the run.
    pub convergence: StrategyConfig,
}

/// Everything the engine needs to execute one work order.
#[derive(Debug, Clone)]
pub struct ExecutionInput {
    pub work_order: WorkOrder,
    pub resolved_spec: ResolvedTaskSpec,
    /// Opaque lease handle from the caller's workspace manager.
    pub lease_id: Option<String>,
}
