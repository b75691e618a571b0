//! Configuration for the control plane.
//!
//! All components carry serde-derived config structs with sensible
//! defaults; [`AgentGateConfig`] bundles them and can be loaded from a
//! TOML file. Resolution chain: explicit path > `AGENTGATE_CONFIG`
//! env var > defaults. A couple of operational knobs can additionally
//! be overridden via environment variables.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::engine::EngineConfig;
use crate::health::HealthThresholds;
use crate::resource::ResourceConfig;
use crate::retry::RetryPolicy;
use crate::sched::SchedulerConfig;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentGateConfig {
    pub engine: EngineConfig,
    pub scheduler: SchedulerConfig,
    pub retry: RetryPolicy,
    pub resources: ResourceConfig,
    pub health: HealthThresholds,
    /// Event bus broadcast capacity.
    pub event_capacity: usize,
}

impl Default for AgentGateConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            scheduler: SchedulerConfig::default(),
            retry: RetryPolicy::default(),
            resources: ResourceConfig::default(),
            health: HealthThresholds::default(),
            event_capacity: 256,
        }
    }
}

impl AgentGateConfig {
    /// Load and parse a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file at {}", path.display()))?;
        let mut config: Self =
            toml::from_str(&contents).context("failed to parse config file")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Resolve configuration: explicit path > `AGENTGATE_CONFIG` >
    /// built-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        if let Ok(env_path) = std::env::var("AGENTGATE_CONFIG") {
            return Self::load(&PathBuf::from(env_path));
        }
        let mut config = Self::default();
        config.apply_env_overrides();
        Ok(config)
    }

    /// Environment overrides for the knobs operators tune most.
    fn apply_env_overrides(&mut self) {
        if let Ok(slots) = std::env::var("AGENTGATE_MAX_SLOTS") {
            match slots.parse::<usize>() {
                Ok(n) if n > 0 => self.resources.max_slots = Some(n),
                _ => tracing::warn!(value = %slots, "ignoring invalid AGENTGATE_MAX_SLOTS"),
            }
        }
        if let Ok(depth) = std::env::var("AGENTGATE_MAX_QUEUE_DEPTH") {
            match depth.parse::<usize>() {
                Ok(n) => self.scheduler.max_queue_depth = n,
                Err(_) => {
                    tracing::warn!(value = %depth, "ignoring invalid AGENTGATE_MAX_QUEUE_DEPTH")
                }
            }
        }
    }
}
