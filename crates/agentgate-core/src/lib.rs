//! AgentGate core: a control plane for running autonomous coding
//! agents under strict verification.
//!
//! A caller submits a work order (task prompt + workspace source +
//! gate configuration). The control plane queues it, claims it when a
//! concurrency slot frees, and drives the agent through a bounded
//! build -> snapshot -> verify -> feedback loop until the gates pass,
//! a convergence strategy stops the loop, or a budget runs out.
//!
//! # Architecture
//!
//! ```text
//! submit(input)
//!     |
//!     v
//! Scheduler (pull-based, staggered) --claim--> ExecutionEngine
//!     ^        \                                  |
//!     |         slot                              v
//! ResourceMonitor                         PhaseOrchestrator
//!     ^                                    build/snapshot/verify/feedback
//!     |                                           |
//! RetryManager <--- FAIL(retryable) --- ConvergenceController
//! ```
//!
//! Components communicate through the [`events::EventBus`]; the agent
//! runtime, verifier, snapshot store, feedback generator, and result
//! store are injected behind the [`capability`] traits.

pub mod capability;
pub mod config;
pub mod control;
pub mod convergence;
pub mod engine;
pub mod error;
pub mod events;
pub mod health;
pub mod metrics;
pub mod order;
pub mod phase;
pub mod resource;
pub mod retry;
pub mod sched;
pub mod state;

pub use config::AgentGateConfig;
pub use control::ControlPlane;
pub use error::{EngineError, ErrorKind};
pub use events::{EngineEvent, EventBus};
pub use order::{ExecutionInput, ResolvedTaskSpec, WorkOrder};
