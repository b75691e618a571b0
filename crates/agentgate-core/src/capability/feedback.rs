//! Feedback generation capability.

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::capability::snapshot::Snapshot;
use crate::capability::verify::VerificationReport;
use crate::order::GatePlan;

/// Context handed to the feedback generator alongside the artifacts.
#[derive(Debug, Clone)]
pub struct FeedbackContext {
    pub run_id: Uuid,
    pub iteration: u32,
    pub task_prompt: String,
}

/// Turns a failed verification into guidance for the next iteration.
///
/// Implementations may be as simple as templating the failed checks or
/// as involved as a summarization model. Failures here are tolerated:
/// the phase orchestrator falls back to synthetic feedback derived
/// directly from the report.
#[async_trait]
pub trait FeedbackGenerator: Send + Sync {
    async fn generate(
        &self,
        snapshot: &Snapshot,
        report: &VerificationReport,
        gate_plan: &GatePlan,
        ctx: &FeedbackContext,
    ) -> Result<String>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn FeedbackGenerator) {}
};
