//! Orchestration of AI photo-editing jobs.
//!
//! Each job runs one external worker process. The worker's line-oriented JSON
//! progress is parsed into per-job state, batches are admitted under a
//! per-batch concurrency cap, and every change is broadcast to subscribers.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod protocol;
pub mod registry;
pub mod state_machine;
pub mod worker;

pub use config::OrchestratorConfig;
pub use dispatcher::{BatchHandle, BatchOptions, BatchSummary};
pub use error::{FailureKind, OrchestratorError};
pub use events::{EventKind, JobEvent};
pub use orchestrator::{Orchestrator, StartRequest};
pub use state_machine::{AgentKey, AgentState, Job, JobId, JobSnapshot, JobStatus, ProgressSnapshot};
