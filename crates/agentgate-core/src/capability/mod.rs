//! Capability interfaces to the outside world.
//!
//! The engine edits no code, runs no tests, and writes no artifacts
//! itself; it drives five narrow capabilities that are implemented
//! elsewhere:
//!
//! ```text
//! Engine / PhaseOrchestrator
//!     |
//!     +-- DriverRegistry --get("claude-code")--> Arc<dyn AgentDriver>
//!     |       execute(request) -> AgentResult
//!     |
//!     +-- Snapshotter: capture_before / capture -> Snapshot
//!     +-- Verifier:    verify(request) -> VerificationReport
//!     +-- FeedbackGenerator: generate(...) -> String
//!     +-- ResultPersister:   save_agent_result / save_verification
//! ```
//!
//! Every trait is object-safe so implementations can be injected as
//! `Arc<dyn ...>` trait objects.

pub mod agent;
pub mod feedback;
pub mod persist;
pub mod snapshot;
pub mod verify;

use std::sync::Arc;

pub use agent::{AgentDriver, AgentRequest, AgentResult, DriverRegistry};
pub use feedback::{FeedbackContext, FeedbackGenerator};
pub use persist::ResultPersister;
pub use snapshot::{BeforeState, Snapshot, Snapshotter};
pub use verify::{CheckResult, LevelResult, VerificationReport, Verifier, VerifyRequest};

/// The full capability set the control plane is wired with.
#[derive(Clone)]
pub struct Capabilities {
    pub drivers: Arc<DriverRegistry>,
    pub snapshotter: Arc<dyn Snapshotter>,
    pub verifier: Arc<dyn Verifier>,
    pub feedback: Arc<dyn FeedbackGenerator>,
    pub persister: Arc<dyn ResultPersister>,
}
