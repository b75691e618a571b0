//! Result persistence capability.
//!
//! The engine writes nothing to disk itself. Implementations own the
//! layout (`runs/<run>/iterations/<n>/agent-result.json`,
//! `.../verification.json`, `.../patch`) under a root the caller
//! chooses; the contents are opaque to the core.

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::capability::agent::AgentResult;
use crate::capability::verify::VerificationReport;

/// Persists per-iteration artifacts.
#[async_trait]
pub trait ResultPersister: Send + Sync {
    async fn save_agent_result(
        &self,
        run_id: Uuid,
        iteration: u32,
        result: &AgentResult,
    ) -> Result<()>;

    async fn save_verification(
        &self,
        run_id: Uuid,
        iteration: u32,
        report: &VerificationReport,
    ) -> Result<()>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn ResultPersister) {}
};
