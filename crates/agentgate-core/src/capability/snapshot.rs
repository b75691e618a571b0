//! Workspace snapshot capability.

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The workspace's content state before any iteration ran. Opaque to
/// the engine beyond being handed back to [`Snapshotter::capture`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeforeState {
    pub content_hash: String,
    pub captured_at: DateTime<Utc>,
}

/// Content-addressed record of the workspace after an iteration.
///
/// The engine only reads `id` and `fingerprint`; everything else is
/// carried for callers and the persistence layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: Uuid,
    pub pre_hash: String,
    pub post_hash: String,
    pub files_added: usize,
    pub files_modified: usize,
    pub files_removed: usize,
    /// Pointer into the content store where the patch lives.
    pub patch_ref: String,
    /// Stable digest of the post-iteration tree, used by
    /// similarity-based loop detection.
    pub fingerprint: Option<String>,
}

/// Captures immutable per-iteration snapshots of a workspace.
#[async_trait]
pub trait Snapshotter: Send + Sync {
    /// Record the workspace state before the run's first iteration.
    async fn capture_before(&self, workspace: &Path) -> Result<BeforeState>;

    /// Capture the workspace after an iteration's edits.
    async fn capture(
        &self,
        workspace: &Path,
        before: &BeforeState,
        run_id: Uuid,
        iteration: u32,
        prompt: &str,
    ) -> Result<Snapshot>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn Snapshotter) {}
};
