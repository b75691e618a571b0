//! Coarse readiness checking.
//!
//! The health checker reads the other components' snapshots and folds
//! them into a `healthy | degraded | unhealthy` verdict with per
//! component detail and operator recommendations. It never affects
//! control flow.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::resource::{PressureLevel, ResourceMonitor};
use crate::retry::RetryManager;
use crate::sched::Scheduler;
use crate::state::StateStore;

/// Thresholds the verdict is computed against.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthThresholds {
    pub queue_depth_warning: usize,
    pub queue_depth_critical: usize,
    pub memory_warning_ratio: f64,
    pub memory_critical_ratio: f64,
    pub pending_retries_warning: usize,
    /// How long an order may sit in `preparing` before it counts as
    /// stuck, in milliseconds.
    pub stuck_preparing_ms: u64,
}

impl HealthThresholds {
    pub fn stuck_preparing(&self) -> Duration {
        Duration::from_millis(self.stuck_preparing_ms)
    }
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            queue_depth_warning: 50,
            queue_depth_critical: 100,
            memory_warning_ratio: 0.8,
            memory_critical_ratio: 0.9,
            pending_retries_warning: 10,
            // 5 minutes.
            stuck_preparing_ms: 5 * 60 * 1000,
        }
    }
}

/// Per-component and overall verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub components: Vec<ComponentHealth>,
    pub recommendations: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

/// Aggregates component snapshots into a health report.
pub struct HealthChecker {
    thresholds: HealthThresholds,
    states: Arc<StateStore>,
    monitor: Arc<ResourceMonitor>,
    scheduler: Arc<Scheduler>,
    retries: Arc<RetryManager>,
}

impl HealthChecker {
    pub fn new(
        thresholds: HealthThresholds,
        states: Arc<StateStore>,
        monitor: Arc<ResourceMonitor>,
        scheduler: Arc<Scheduler>,
        retries: Arc<RetryManager>,
    ) -> Self {
        Self {
            thresholds,
            states,
            monitor,
            scheduler,
            retries,
        }
    }

    pub fn check(&self) -> HealthReport {
        let mut components = Vec::new();
        let mut recommendations = Vec::new();

        // Scheduler queue.
        let depth = self.scheduler.depth();
        let queue_status = if depth >= self.thresholds.queue_depth_critical {
            recommendations
                .push("queue depth critical: add capacity or pause submissions".to_owned());
            HealthStatus::Unhealthy
        } else if depth >= self.thresholds.queue_depth_warning {
            recommendations.push("queue depth elevated: consider adding slots".to_owned());
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        components.push(ComponentHealth {
            name: "scheduler".to_owned(),
            status: queue_status,
            detail: format!("queue depth {depth}"),
        });

        // Memory / slots.
        let resources = self.monitor.snapshot();
        let ratio = resources.memory.used_ratio();
        let memory_status = if resources.pressure == PressureLevel::Critical
            || ratio >= self.thresholds.memory_critical_ratio
        {
            recommendations
                .push("memory critical: no new slots will be granted until it recovers".to_owned());
            HealthStatus::Unhealthy
        } else if resources.pressure == PressureLevel::Warning
            || ratio >= self.thresholds.memory_warning_ratio
        {
            recommendations.push("memory elevated: watch for pressure escalation".to_owned());
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        components.push(ComponentHealth {
            name: "resources".to_owned(),
            status: memory_status,
            detail: format!(
                "slots {}/{} in use, memory {:.0}% used, pressure {}",
                resources.slots_in_use,
                resources.slots_total,
                ratio * 100.0,
                resources.pressure
            ),
        });

        // Retry backlog.
        let pending_retries = self.retries.stats().pending;
        let retry_status = if pending_retries >= self.thresholds.pending_retries_warning {
            recommendations.push(
                "many orders waiting on retry: check agent and verifier failure rates".to_owned(),
            );
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        components.push(ComponentHealth {
            name: "retries".to_owned(),
            status: retry_status,
            detail: format!("{pending_retries} pending"),
        });

        // Stuck orders.
        let stuck = self
            .states
            .stuck_in_preparing(self.thresholds.stuck_preparing());
        let stuck_status = if stuck.is_empty() {
            HealthStatus::Healthy
        } else {
            recommendations.push(format!(
                "{} order(s) stuck in preparing: inspect workspace acquisition",
                stuck.len()
            ));
            HealthStatus::Degraded
        };
        components.push(ComponentHealth {
            name: "orders".to_owned(),
            status: stuck_status,
            detail: format!("{} stuck in preparing", stuck.len()),
        });

        let status = components
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);

        HealthReport {
            status,
            components,
            recommendations,
            checked_at: Utc::now(),
        }
    }
}
