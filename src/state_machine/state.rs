use std::path::PathBuf;

use chrono::Utc;

use super::job::{AgentKey, AgentState, Job, JobStatus};
use crate::error::FailureKind;
use crate::protocol::ProgressEvent;

/// Stage labels the worker emits, and the agent each one reports on.
const STAGE_AGENTS: &[(&str, AgentKey)] = &[
    ("analysis", AgentKey::Analysis),
    ("analysis_complete", AgentKey::Analysis),
    ("background_removal", AgentKey::Background),
    ("gemini_editing", AgentKey::AiEdit),
    ("gemini_complete", AgentKey::AiEdit),
    ("gemini_failed", AgentKey::AiEdit),
    ("imagemagick_optimization", AgentKey::ParametricEdit),
    ("imagemagick_fallback", AgentKey::ParametricEdit),
    ("quality_control", AgentKey::QualityControl),
    ("enhanced_success", AgentKey::QualityControl),
    ("enhanced_complete_imperfect", AgentKey::QualityControl),
    ("enhanced_error", AgentKey::QualityControl),
];

pub fn agent_for_stage(stage: &str) -> Option<AgentKey> {
    STAGE_AGENTS
        .iter()
        .find(|(name, _)| *name == stage)
        .map(|(_, agent)| *agent)
}

/// "complete" wins over "failed"/"error"; anything else is still running.
pub fn state_for_stage(stage: &str) -> AgentState {
    let lower = stage.to_lowercase();
    if lower.contains("complete") {
        AgentState::Completed
    } else if lower.contains("failed") || lower.contains("error") {
        AgentState::Error
    } else {
        AgentState::Running
    }
}

/// What applying an input did to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Progress fields changed; status did not.
    Progress,
    /// The job reached the given terminal status.
    Finished(JobStatus),
    /// The input had no effect (usually because the job is already terminal).
    Ignored,
}

/// Applies worker output and lifecycle signals to a `Job`.
///
/// Every status change funnels through one guard, so a terminal status is
/// never left and pending/running are never re-entered.
pub struct StateMachine;

impl StateMachine {
    pub fn mark_running(job: &mut Job) -> Transition {
        if !Self::advance(job, JobStatus::Running) {
            return Transition::Ignored;
        }
        job.started_at = Some(job.updated_at);
        job.progress.stage = "starting".to_string();
        job.progress.message = "Worker started".to_string();
        Transition::Progress
    }

    /// Folds one parsed record into the job.
    ///
    /// An explicit `success: true` completes the job on the spot; the exit
    /// code that follows can no longer change that.
    pub fn apply(job: &mut Job, event: &ProgressEvent) -> Transition {
        if job.status.is_terminal() {
            // A completed job may still learn where its artifact went.
            if job.status == JobStatus::Completed
                && let Some(path) = non_empty(event.output_path.as_deref())
            {
                job.output_path = Some(PathBuf::from(path));
                job.updated_at = Utc::now();
                return Transition::Progress;
            }
            return Transition::Ignored;
        }

        let progress = &mut job.progress;
        if let Some(statuses) = &event.agent_status {
            for (agent, state) in statuses {
                progress.agent_status.insert(*agent, *state);
            }
        } else if let Some(stage) = &event.stage
            && let Some(agent) = agent_for_stage(stage)
        {
            progress.agent_status.insert(agent, state_for_stage(stage));
        }

        if let Some(message) = &event.message {
            progress.message = message.clone();
        }
        if let Some(stage) = &event.stage {
            progress.stage = stage.clone();
        }
        if let Some(score) = event.quality_score {
            progress.quality_score = Some(score);
        }
        if let Some(strategy) = &event.strategy {
            progress.strategy = Some(strategy.clone());
        }
        if let Some(error) = &event.error {
            progress.last_error = Some(error.clone());
        }
        if let Some(path) = non_empty(event.output_path.as_deref()) {
            job.output_path = Some(PathBuf::from(path));
        }
        job.updated_at = Utc::now();

        match event.success {
            Some(true) => {
                job.quality_passed = Some(true);
                if Self::advance(job, JobStatus::Completed) {
                    return Transition::Finished(JobStatus::Completed);
                }
                Transition::Progress
            }
            Some(false) => {
                job.quality_passed = Some(false);
                Transition::Progress
            }
            None => Transition::Progress,
        }
    }

    /// Exit code 0 completes, anything else (including death by signal) fails.
    pub fn on_exit(job: &mut Job, exit_code: Option<i32>) -> Transition {
        if job.status.is_terminal() {
            return Transition::Ignored;
        }

        if exit_code == Some(0) {
            Self::advance(job, JobStatus::Completed);
            return Transition::Finished(JobStatus::Completed);
        }

        let failure = FailureKind::WorkerRuntime { exit_code };
        // Keep the worker's own explanation when it gave one.
        let message = match &job.progress.last_error {
            Some(_) => job.progress.message.clone(),
            None => failure.to_string(),
        };
        Self::fail(job, failure, message)
    }

    pub fn cancel(job: &mut Job, message: &str) -> Transition {
        if !Self::advance(job, JobStatus::Cancelled) {
            return Transition::Ignored;
        }
        job.progress.stage = "cancelled".to_string();
        job.progress.message = message.to_string();
        Transition::Finished(JobStatus::Cancelled)
    }

    pub fn fail(job: &mut Job, failure: FailureKind, message: String) -> Transition {
        if !Self::advance(job, JobStatus::Failed) {
            return Transition::Ignored;
        }
        job.progress.stage = "error".to_string();
        job.progress.message = message;
        job.failure = Some(failure);
        Transition::Finished(JobStatus::Failed)
    }

    fn advance(job: &mut Job, next: JobStatus) -> bool {
        if !job.status.can_transition_to(next) {
            return false;
        }
        let now = Utc::now();
        job.status = next;
        job.updated_at = now;
        if next.is_terminal() {
            job.finished_at = Some(now);
        }
        true
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
