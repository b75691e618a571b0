//! Convergence control: deciding whether the iterate-verify loop keeps
//! going.
//!
//! After every failed verification the engine asks the controller for a
//! decision. The controller derives gate results and a progress metric
//! from the verification report, maintains the cross-iteration history
//! (fingerprints, progress), and delegates the continue/stop call to
//! the run's [`ConvergenceStrategy`](strategy::ConvergenceStrategy).

pub mod strategy;

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

pub use strategy::{ConvergenceStrategy, StrategyConfig, StrategyRegistry};

use crate::capability::VerificationReport;
use crate::order::GatePlan;

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

/// What the strategy wants the engine to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Continue,
    Stop,
}

/// A strategy's verdict for one iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: Action,
    pub reason: String,
    /// Strategy confidence in `[0, 1]`.
    pub confidence: f64,
}

impl Decision {
    pub fn proceed(reason: impl Into<String>, confidence: f64) -> Self {
        Self {
            action: Action::Continue,
            reason: reason.into(),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    pub fn stop(reason: impl Into<String>, confidence: f64) -> Self {
        Self {
            action: Action::Stop,
            reason: reason.into(),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    pub fn is_continue(&self) -> bool {
        self.action == Action::Continue
    }
}

// ---------------------------------------------------------------------------
// Gate results and progress
// ---------------------------------------------------------------------------

/// One gate's outcome, derived from a verification report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub name: String,
    pub passed: bool,
    pub levels_passed: usize,
    pub levels_total: usize,
}

impl GateResult {
    /// Per-gate progress: 1.0 when passed, the fraction of levels
    /// passed for verification-level gates, else 0.
    pub fn progress(&self) -> f64 {
        if self.passed {
            1.0
        } else if self.levels_total > 0 {
            self.levels_passed as f64 / self.levels_total as f64
        } else {
            0.0
        }
    }
}

/// Derive per-gate results from a report against the plan.
pub fn gate_results(plan: &GatePlan, report: &VerificationReport) -> Vec<GateResult> {
    plan.gates
        .iter()
        .map(|gate| {
            let levels_total = gate.levels.len();
            let levels_passed = gate
                .levels
                .iter()
                .filter(|level| report.level_passed(**level) == Some(true))
                .count();
            let passed = if levels_total > 0 {
                levels_passed == levels_total
            } else {
                report.passed
            };
            GateResult {
                name: gate.name.clone(),
                passed,
                levels_passed,
                levels_total,
            }
        })
        .collect()
}

/// Mean progress over all gates, in `[0, 1]`. Empty plans score 0.
pub fn overall_progress(results: &[GateResult]) -> f64 {
    if results.is_empty() {
        return 0.0;
    }
    results.iter().map(GateResult::progress).sum::<f64>() / results.len() as f64
}

/// Direction of the progress metric between two iterations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Regressing,
    Stagnant,
}

/// Band half-width within which progress counts as stagnant.
const TREND_BAND: f64 = 0.05;

pub fn trend(previous: f64, current: f64) -> Trend {
    if current > previous + TREND_BAND {
        Trend::Improving
    } else if current < previous - TREND_BAND {
        Trend::Regressing
    } else {
        Trend::Stagnant
    }
}

// ---------------------------------------------------------------------------
// Similarity and loop detection
// ---------------------------------------------------------------------------

/// Lowercased whitespace tokens longer than two characters.
pub fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split_whitespace()
        .filter(|t| t.len() > 2)
        .map(str::to_owned)
        .collect()
}

/// Jaccard similarity of two texts' token sets.
///
/// Two empty token sets are defined as identical (similarity 1), so
/// repeated empty outputs still trip loop detection.
pub fn jaccard(a: &str, b: &str) -> f64 {
    let set_a = tokenize(a);
    let set_b = tokenize(b);
    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    intersection as f64 / union as f64
}

/// True when the last three fingerprints are pairwise equal.
pub fn fingerprint_loop(fingerprints: &[String]) -> bool {
    if fingerprints.len() < 3 {
        return false;
    }
    let tail = &fingerprints[fingerprints.len() - 3..];
    tail.windows(2).all(|pair| pair[0] == pair[1])
}

// ---------------------------------------------------------------------------
// ConvergenceState and controller
// ---------------------------------------------------------------------------

/// Decision context rebuilt for each iteration. Not persisted.
#[derive(Debug, Clone)]
pub struct ConvergenceState {
    /// 1-based iteration that just finished.
    pub iteration: u32,
    pub gate_results: Vec<GateResult>,
    pub last_output: Option<String>,
    /// Snapshot fingerprints, oldest first.
    pub recent_fingerprints: Vec<String>,
    /// Overall progress per iteration, oldest first (current last).
    pub progress_history: Vec<f64>,
}

impl ConvergenceState {
    pub fn all_gates_passed(&self) -> bool {
        !self.gate_results.is_empty() && self.gate_results.iter().all(|g| g.passed)
    }

    pub fn current_progress(&self) -> f64 {
        self.progress_history.last().copied().unwrap_or(0.0)
    }

    pub fn trend(&self) -> Trend {
        match self.progress_history.as_slice() {
            [.., previous, current] => trend(*previous, *current),
            _ => Trend::Stagnant,
        }
    }
}

/// How many fingerprints/progress points the controller keeps.
const HISTORY_CAP: usize = 16;

/// Owns the outer-loop decision for one run.
pub struct ConvergenceController {
    strategy: Box<dyn ConvergenceStrategy>,
    fingerprints: Vec<String>,
    progress_history: Vec<f64>,
}

impl ConvergenceController {
    pub fn new(mut strategy: Box<dyn ConvergenceStrategy>) -> Self {
        strategy.initialize();
        Self {
            strategy,
            fingerprints: Vec::new(),
            progress_history: Vec::new(),
        }
    }

    pub fn strategy_name(&self) -> &str {
        self.strategy.name()
    }

    /// Fold one iteration's artifacts into the history and ask the
    /// strategy for a decision.
    pub fn decide(
        &mut self,
        iteration: u32,
        plan: &GatePlan,
        report: Option<&VerificationReport>,
        last_output: Option<&str>,
        fingerprint: Option<&str>,
    ) -> Decision {
        if let Some(fp) = fingerprint {
            self.fingerprints.push(fp.to_owned());
            if self.fingerprints.len() > HISTORY_CAP {
                self.fingerprints.remove(0);
            }
        }

        let gate_results = report
            .map(|r| gate_results(plan, r))
            .unwrap_or_default();
        self.progress_history.push(overall_progress(&gate_results));
        if self.progress_history.len() > HISTORY_CAP {
            self.progress_history.remove(0);
        }

        let state = ConvergenceState {
            iteration,
            gate_results,
            last_output: last_output.map(str::to_owned),
            recent_fingerprints: self.fingerprints.clone(),
            progress_history: self.progress_history.clone(),
        };

        let decision = self.strategy.should_continue(&state);
        tracing::debug!(
            iteration,
            strategy = self.strategy.name(),
            action = ?decision.action,
            reason = %decision.reason,
            progress = state.current_progress(),
            "convergence decision"
        );
        decision
    }

    /// Clear controller and strategy history for reuse across runs.
    pub fn reset(&mut self) {
        self.fingerprints.clear();
        self.progress_history.clear();
        self.strategy.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jaccard_is_reflexive_and_symmetric() {
        let a = "refactor the parser module";
        let b = "rewrite the lexer module";
        assert_eq!(jaccard(a, a), 1.0);
        assert_eq!(jaccard(a, b), jaccard(b, a));
    }

    #[test]
    fn jaccard_of_empty_token_sets_is_one() {
        assert_eq!(jaccard("", ""), 1.0);
        // Tokens of length <= 2 are dropped, so these sets are empty too.
        assert_eq!(jaccard("a b c", "x y"), 1.0);
    }

    #[test]
    fn jaccard_is_case_insensitive() {
        assert_eq!(jaccard("Parser Module", "parser module"), 1.0);
    }

    #[test]
    fn fingerprint_loop_needs_three_equal() {
        let fp = |s: &str| s.to_owned();
        assert!(!fingerprint_loop(&[fp("a"), fp("a")]));
        assert!(fingerprint_loop(&[fp("x"), fp("a"), fp("a"), fp("a")]));
        assert!(!fingerprint_loop(&[fp("a"), fp("b"), fp("a")]));
    }

    #[test]
    fn trend_uses_band() {
        assert_eq!(trend(0.5, 0.56), Trend::Improving);
        assert_eq!(trend(0.5, 0.44), Trend::Regressing);
        assert_eq!(trend(0.5, 0.53), Trend::Stagnant);
        assert_eq!(trend(0.5, 0.47), Trend::Stagnant);
    }

    #[test]
    fn gate_progress_scoring() {
        let passed = GateResult {
            name: "L1".into(),
            passed: true,
            levels_passed: 1,
            levels_total: 1,
        };
        let partial = GateResult {
            name: "all".into(),
            passed: false,
            levels_passed: 2,
            levels_total: 4,
        };
        let levelless = GateResult {
            name: "custom".into(),
            passed: false,
            levels_passed: 0,
            levels_total: 0,
        };
        assert_eq!(passed.progress(), 1.0);
        assert_eq!(partial.progress(), 0.5);
        assert_eq!(levelless.progress(), 0.0);
        assert_eq!(
            overall_progress(&[passed, partial, levelless]),
            (1.0 + 0.5 + 0.0) / 3.0
        );
    }
}
