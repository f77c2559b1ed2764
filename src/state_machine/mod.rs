mod job;
mod state;

pub use job::{AgentKey, AgentState, Job, JobId, JobSnapshot, JobStatus, ProgressSnapshot};
pub use state::{StateMachine, Transition, agent_for_stage, state_for_stage};
