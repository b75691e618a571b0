//! The `AgentDriver` trait -- the adapter interface for agent runtimes.
//!
//! Each concrete driver wraps a specific coding-agent runtime (a CLI
//! subprocess, a library, a remote service) and translates one bounded
//! invocation into an [`AgentResult`]. The trait is object-safe so
//! drivers can be stored as `Arc<dyn AgentDriver>` in the
//! [`DriverRegistry`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::BuildFailureKind;
use crate::order::ExecutionPolicies;

/// One bounded agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub workspace_path: PathBuf,
    pub task_prompt: String,
    /// Verification feedback from the previous iteration, if any.
    pub feedback: Option<String>,
    /// Continuation token from the previous iteration, if any.
    pub session_id: Option<String>,
    /// 1-based iteration number within the run.
    pub iteration: u32,
    pub timeout: Duration,
    /// Sandbox constraints the driver must enforce.
    pub constraints: Option<ExecutionPolicies>,
    /// Fires when the run is cancelled; the driver should stop the
    /// agent and return promptly.
    pub cancel: CancellationToken,
}

/// What one agent invocation produced.
#[derive(Debug, Clone)]
pub struct AgentResult {
    pub success: bool,
    /// Continuation token for the next invocation. Propagated even on
    /// failure so the agent can resume its reasoning.
    pub session_id: Option<String>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub tokens_used: Option<u64>,
    /// Set when `success` is false.
    pub failure: Option<BuildFailureKind>,
}

/// Adapter interface for coding-agent runtimes.
#[async_trait]
pub trait AgentDriver: Send + Sync {
    /// Registry key for this driver (e.g. "claude-code").
    fn kind(&self) -> &str;

    /// Run the agent once against the workspace.
    ///
    /// Implementations own process lifetime, timeout enforcement, and
    /// cancellation; a driver-level failure is reported through
    /// [`AgentResult::failure`], while `Err` is reserved for faults in
    /// the driver itself.
    async fn execute(&self, request: AgentRequest) -> Result<AgentResult>;
}

// Compile-time assertion: AgentDriver must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn AgentDriver) {}
};

/// A collection of registered [`AgentDriver`]s, keyed by kind.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn AgentDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver under the kind it reports.
    ///
    /// If a driver with the same kind is already registered it is
    /// replaced and the old one returned.
    pub fn register(&mut self, driver: impl AgentDriver + 'static) -> Option<Arc<dyn AgentDriver>> {
        let kind = driver.kind().to_owned();
        self.drivers.insert(kind, Arc::new(driver))
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn AgentDriver>> {
        self.drivers.get(kind).map(Arc::clone)
    }

    /// Resolve a preferred kind, falling back to the first registered
    /// driver when the preference is unknown.
    pub fn resolve(&self, preferred: &str) -> Option<Arc<dyn AgentDriver>> {
        if let Some(driver) = self.get(preferred) {
            return Some(driver);
        }
        let fallback = self.drivers.values().next().map(Arc::clone)?;
        tracing::warn!(
            preferred,
            fallback = fallback.kind(),
            "preferred agent driver not found, falling back to first registered"
        );
        Some(fallback)
    }

    pub fn list(&self) -> Vec<&str> {
        self.drivers.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.drivers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopDriver {
        driver_kind: String,
    }

    impl NoopDriver {
        fn new(kind: &str) -> Self {
            Self {
                driver_kind: kind.to_owned(),
            }
        }
    }

    #[async_trait]
    impl AgentDriver for NoopDriver {
        fn kind(&self) -> &str {
            &self.driver_kind
        }

        async fn execute(&self, _request: AgentRequest) -> Result<AgentResult> {
            Ok(AgentResult {
                success: true,
                session_id: None,
                stdout: String::new(),
                stderr: String::new(),
                duration: Duration::ZERO,
                tokens_used: None,
                failure: None,
            })
        }
    }

    #[test]
    fn register_and_get() {
        let mut registry = DriverRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.register(NoopDriver::new("alpha")).is_none());
        assert_eq!(registry.get("alpha").unwrap().kind(), "alpha");
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn register_replaces_existing() {
        let mut registry = DriverRegistry::new();
        registry.register(NoopDriver::new("alpha"));
        let old = registry.register(NoopDriver::new("alpha"));
        assert_eq!(old.unwrap().kind(), "alpha");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn resolve_falls_back_to_first_registered() {
        let mut registry = DriverRegistry::new();
        registry.register(NoopDriver::new("alpha"));
        assert_eq!(registry.resolve("missing").unwrap().kind(), "alpha");
        assert!(DriverRegistry::new().resolve("missing").is_none());
    }
}
