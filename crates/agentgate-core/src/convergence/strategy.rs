//! Convergence strategies and their registry.
//!
//! A strategy is a decision function over iteration history. One
//! instance is created per run from a [`StrategyConfig`]; the registry
//! maps strategy kinds to factories and is frozen after startup.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use super::{fingerprint_loop, jaccard, overall_progress, ConvergenceState, Decision};
use crate::error::EngineError;

/// Completion signals recognized by default (case-insensitive).
pub const DEFAULT_COMPLETION_SIGNALS: [&str; 2] = ["TASK_COMPLETE", "DONE"];

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Which strategy a run uses, with its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategyConfig {
    /// Run up to `max_iterations`, stopping early only when gates pass.
    Fixed { max_iterations: u32 },
    /// Run `base_iterations` unconditionally, then up to
    /// `bonus_iterations` more while progress stays at or above
    /// `progress_threshold`. Stops early on fingerprint loops.
    Hybrid {
        base_iterations: u32,
        bonus_iterations: u32,
        progress_threshold: f64,
    },
    /// Run until the agent signals completion or its outputs converge.
    Ralph {
        min_iterations: u32,
        /// Outputs with pairwise similarity >= `1 - convergence_threshold`
        /// count as converged.
        convergence_threshold: f64,
        window_size: usize,
        /// Completion signals; empty means the defaults.
        #[serde(default)]
        completion_signals: Vec<String>,
    },
    /// Never stops on its own.
    Manual,
    /// Reserved hook; currently behaves like a default hybrid.
    Adaptive,
}

impl StrategyConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Fixed { .. } => "fixed",
            Self::Hybrid { .. } => "hybrid",
            Self::Ralph { .. } => "ralph",
            Self::Manual => "manual",
            Self::Adaptive => "adaptive",
        }
    }
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self::Fixed { max_iterations: 5 }
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// A pluggable continue/stop decision function.
///
/// Strategies may keep private history across calls within a run;
/// [`ConvergenceStrategy::reset`] clears it for reuse.
pub trait ConvergenceStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Called once before the run's first iteration.
    fn initialize(&mut self) {}

    fn should_continue(&mut self, state: &ConvergenceState) -> Decision;

    fn reset(&mut self);

    /// The strategy's view of progress, defaulting to the gate mean.
    fn progress(&self, state: &ConvergenceState) -> f64 {
        overall_progress(&state.gate_results)
    }
}

const _: () = {
    fn _assert_object_safe(_: &dyn ConvergenceStrategy) {}
};

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

type StrategyFactory = fn(&StrategyConfig) -> Box<dyn ConvergenceStrategy>;

/// Maps strategy kinds to factories. Built at startup, frozen after.
pub struct StrategyRegistry {
    factories: HashMap<&'static str, StrategyFactory>,
}

impl StrategyRegistry {
    /// Registry with all built-in strategies.
    pub fn with_builtins() -> Self {
        let mut factories: HashMap<&'static str, StrategyFactory> = HashMap::new();
        factories.insert("fixed", |cfg| Box::new(FixedStrategy::from_config(cfg)));
        factories.insert("hybrid", |cfg| Box::new(HybridStrategy::from_config(cfg)));
        factories.insert("ralph", |cfg| Box::new(RalphStrategy::from_config(cfg)));
        factories.insert("manual", |_| Box::new(ManualStrategy));
        factories.insert("adaptive", |_| Box::new(HybridStrategy::adaptive_default()));
        Self { factories }
    }

    /// Instantiate the strategy a config names.
    pub fn create(&self, config: &StrategyConfig) -> Result<Box<dyn ConvergenceStrategy>, EngineError> {
        let factory = self.factories.get(config.kind()).ok_or_else(|| {
            EngineError::Validation(format!("unknown convergence strategy: {}", config.kind()))
        })?;
        Ok(factory(config))
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.factories.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

// ---------------------------------------------------------------------------
// fixed
// ---------------------------------------------------------------------------

/// Stop when gates pass, else continue up to a fixed iteration count.
pub struct FixedStrategy {
    max_iterations: u32,
}

impl FixedStrategy {
    pub fn new(max_iterations: u32) -> Self {
        Self { max_iterations }
    }

    fn from_config(cfg: &StrategyConfig) -> Self {
        match cfg {
            StrategyConfig::Fixed { max_iterations } => Self::new(*max_iterations),
            _ => Self::new(5),
        }
    }
}

impl ConvergenceStrategy for FixedStrategy {
    fn name(&self) -> &str {
        "fixed"
    }

    fn should_continue(&mut self, state: &ConvergenceState) -> Decision {
        if state.all_gates_passed() {
            return Decision::stop("all gates passed", 1.0);
        }
        if state.iteration >= self.max_iterations {
            return Decision::stop(
                format!("iteration budget of {} exhausted", self.max_iterations),
                1.0,
            );
        }
        Decision::proceed(
            format!(
                "gates failing, {} of {} iterations used",
                state.iteration, self.max_iterations
            ),
            0.6,
        )
    }

    fn reset(&mut self) {}
}

// ---------------------------------------------------------------------------
// hybrid
// ---------------------------------------------------------------------------

/// Unconditional base iterations, then bonus iterations gated on
/// measured progress. Stops early when the last three snapshots are
/// identical.
pub struct HybridStrategy {
    base_iterations: u32,
    bonus_iterations: u32,
    progress_threshold: f64,
}

impl HybridStrategy {
    pub fn new(base_iterations: u32, bonus_iterations: u32, progress_threshold: f64) -> Self {
        Self {
            base_iterations,
            bonus_iterations,
            progress_threshold,
        }
    }

    fn from_config(cfg: &StrategyConfig) -> Self {
        match cfg {
            StrategyConfig::Hybrid {
                base_iterations,
                bonus_iterations,
                progress_threshold,
            } => Self::new(*base_iterations, *bonus_iterations, *progress_threshold),
            _ => Self::adaptive_default(),
        }
    }

    /// The defaults the `adaptive` kind currently resolves to.
    pub fn adaptive_default() -> Self {
        Self::new(3, 2, 0.1)
    }
}

impl ConvergenceStrategy for HybridStrategy {
    fn name(&self) -> &str {
        "hybrid"
    }

    fn should_continue(&mut self, state: &ConvergenceState) -> Decision {
        if state.all_gates_passed() {
            return Decision::stop("all gates passed", 1.0);
        }
        if fingerprint_loop(&state.recent_fingerprints) {
            return Decision::stop("last three snapshots are identical", 0.8);
        }
        if state.iteration < self.base_iterations {
            return Decision::proceed(
                format!("within base budget of {} iterations", self.base_iterations),
                0.7,
            );
        }
        let limit = self.base_iterations + self.bonus_iterations;
        if state.iteration >= limit {
            return Decision::stop(format!("iteration budget of {limit} exhausted"), 1.0);
        }
        let progress = state.current_progress();
        if progress >= self.progress_threshold {
            Decision::proceed(
                format!(
                    "bonus iteration granted, progress {progress:.2} >= {:.2}",
                    self.progress_threshold
                ),
                0.6,
            )
        } else {
            Decision::stop(
                format!(
                    "progress {progress:.2} below threshold {:.2}",
                    self.progress_threshold
                ),
                0.7,
            )
        }
    }

    fn reset(&mut self) {}
}

// ---------------------------------------------------------------------------
// ralph
// ---------------------------------------------------------------------------

/// Continue until the agent announces completion or its outputs
/// converge to a loop.
pub struct RalphStrategy {
    min_iterations: u32,
    convergence_threshold: f64,
    window_size: usize,
    completion_signals: Vec<String>,
    /// Recent agent outputs, oldest first.
    window: VecDeque<String>,
}

impl RalphStrategy {
    pub fn new(
        min_iterations: u32,
        convergence_threshold: f64,
        window_size: usize,
        completion_signals: Vec<String>,
    ) -> Self {
        let completion_signals = if completion_signals.is_empty() {
            DEFAULT_COMPLETION_SIGNALS
                .iter()
                .map(|s| (*s).to_owned())
                .collect()
        } else {
            completion_signals
        };
        Self {
            min_iterations,
            convergence_threshold,
            window_size: window_size.max(2),
            completion_signals,
            window: VecDeque::new(),
        }
    }

    fn from_config(cfg: &StrategyConfig) -> Self {
        match cfg {
            StrategyConfig::Ralph {
                min_iterations,
                convergence_threshold,
                window_size,
                completion_signals,
            } => Self::new(
                *min_iterations,
                *convergence_threshold,
                *window_size,
                completion_signals.clone(),
            ),
            _ => Self::new(1, 0.05, 3, Vec::new()),
        }
    }

    /// Case-insensitive substring match against the signal set.
    fn completion_signal(&self, output: &str) -> Option<&str> {
        let lowered = output.to_lowercase();
        self.completion_signals
            .iter()
            .find(|signal| lowered.contains(&signal.to_lowercase()))
            .map(String::as_str)
    }

    /// All pairs in the window at or above the similarity bar.
    fn window_converged(&self) -> bool {
        if self.window.len() < self.window_size {
            return false;
        }
        let bar = 1.0 - self.convergence_threshold;
        let outputs: Vec<&String> = self.window.iter().collect();
        for i in 0..outputs.len() {
            for j in (i + 1)..outputs.len() {
                if jaccard(outputs[i], outputs[j]) < bar {
                    return false;
                }
            }
        }
        true
    }
}

impl ConvergenceStrategy for RalphStrategy {
    fn name(&self) -> &str {
        "ralph"
    }

    fn initialize(&mut self) {
        self.window.clear();
    }

    fn should_continue(&mut self, state: &ConvergenceState) -> Decision {
        if let Some(output) = &state.last_output {
            self.window.push_back(output.clone());
            while self.window.len() > self.window_size {
                self.window.pop_front();
            }
        }

        if state.all_gates_passed() {
            return Decision::stop("all gates passed", 1.0);
        }
        if state.iteration < self.min_iterations {
            return Decision::proceed(
                format!("below minimum of {} iterations", self.min_iterations),
                0.8,
            );
        }
        if let Some(output) = &state.last_output {
            if let Some(signal) = self.completion_signal(output) {
                return Decision::stop(
                    format!("agent emitted completion signal {signal:?}"),
                    0.9,
                );
            }
        }
        if self.window_converged() {
            return Decision::stop(
                format!(
                    "last {} outputs converged above similarity {:.2}",
                    self.window.len(),
                    1.0 - self.convergence_threshold
                ),
                0.8,
            );
        }
        Decision::proceed("no completion signal, outputs still diverging", 0.5)
    }

    fn reset(&mut self) {
        self.window.clear();
    }
}

// ---------------------------------------------------------------------------
// manual
// ---------------------------------------------------------------------------

/// Never stops on its own; only passing gates or an external cancel
/// end the run.
pub struct ManualStrategy;

impl ConvergenceStrategy for ManualStrategy {
    fn name(&self) -> &str {
        "manual"
    }

    fn should_continue(&mut self, state: &ConvergenceState) -> Decision {
        if state.all_gates_passed() {
            return Decision::stop("all gates passed", 1.0);
        }
        Decision::proceed("manual strategy never stops on its own", 1.0)
    }

    fn reset(&mut self) {}
}
