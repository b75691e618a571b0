//! Verification capability and report model.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::order::{GateLevel, GatePlan};

/// One check within a verification level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub detail: Option<String>,
}

/// Outcome of one verification level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevelResult {
    pub level: GateLevel,
    pub passed: bool,
    pub checks: Vec<CheckResult>,
}

/// Everything one verifier invocation produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationReport {
    pub id: Uuid,
    pub passed: bool,
    /// Per-level results, ordered L0..L3. Skipped levels are absent.
    pub levels: Vec<LevelResult>,
    pub diagnostics: Vec<String>,
    pub duration: Duration,
}

impl VerificationReport {
    /// Whether a given level passed. `None` when the level did not run.
    pub fn level_passed(&self, level: GateLevel) -> Option<bool> {
        self.levels.iter().find(|l| l.level == level).map(|l| l.passed)
    }

    /// Fraction of executed levels that passed, in `[0, 1]`.
    pub fn level_fraction(&self) -> f64 {
        if self.levels.is_empty() {
            return 0.0;
        }
        let passed = self.levels.iter().filter(|l| l.passed).count();
        passed as f64 / self.levels.len() as f64
    }

    /// Failed checks in level order L0..L3, for feedback synthesis.
    pub fn failed_checks(&self) -> impl Iterator<Item = (GateLevel, &CheckResult)> {
        let mut levels: Vec<&LevelResult> = self.levels.iter().collect();
        levels.sort_by_key(|l| l.level);
        levels.into_iter().flat_map(|l| {
            l.checks
                .iter()
                .filter(|c| !c.passed)
                .map(move |c| (l.level, c))
        })
    }
}

/// One verifier invocation.
#[derive(Debug, Clone)]
pub struct VerifyRequest {
    /// Path of the captured tree to verify.
    pub snapshot_path: PathBuf,
    pub gate_plan: GatePlan,
    pub run_id: Uuid,
    pub iteration: u32,
    pub timeout: Duration,
    pub skip_levels: Vec<GateLevel>,
}

/// Runs the gate levels in a clean room and reports per-check results.
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, request: VerifyRequest) -> Result<VerificationReport>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn Verifier) {}
};
