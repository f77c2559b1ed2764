use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FailureKind;

/// Opaque job identifier (a UUID v4 string).
pub type JobId = String;

/// The pipeline agents a worker reports on.
///
/// Serialized with the worker's wire names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AgentKey {
    #[serde(rename = "analysis")]
    Analysis,
    #[serde(rename = "background")]
    Background,
    #[serde(rename = "gemini")]
    AiEdit,
    #[serde(rename = "imagemagick")]
    ParametricEdit,
    #[serde(rename = "qc")]
    QualityControl,
}

impl AgentKey {
    pub const ALL: [AgentKey; 5] = [
        AgentKey::Analysis,
        AgentKey::Background,
        AgentKey::AiEdit,
        AgentKey::ParametricEdit,
        AgentKey::QualityControl,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKey::Analysis => "analysis",
            AgentKey::Background => "background",
            AgentKey::AiEdit => "gemini",
            AgentKey::ParametricEdit => "imagemagick",
            AgentKey::QualityControl => "qc",
        }
    }

    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|key| key.as_str() == name)
    }
}

impl fmt::Display for AgentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-agent progress as reported by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Pending,
    Running,
    Completed,
    Error,
}

impl AgentState {
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "pending" => Some(AgentState::Pending),
            "running" => Some(AgentState::Running),
            "completed" => Some(AgentState::Completed),
            "error" => Some(AgentState::Error),
            _ => None,
        }
    }
}

/// Tracks the lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Status only moves forward: pending → running → terminal. A pending job
    /// may also end directly (failed before spawn, or cancelled in the queue).
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match self {
            JobStatus::Pending => next != JobStatus::Pending,
            JobStatus::Running => next.is_terminal(),
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// What the worker has told us so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub stage: String,
    pub message: String,
    #[serde(rename = "agentStatus")]
    pub agent_status: BTreeMap<AgentKey, AgentState>,
    pub quality_score: Option<f64>,
    pub strategy: Option<String>,
    /// Last `error` text reported by the worker.
    pub last_error: Option<String>,
}

impl Default for ProgressSnapshot {
    fn default() -> Self {
        Self {
            stage: "initializing".to_string(),
            message: "Queued".to_string(),
            agent_status: AgentKey::ALL
                .into_iter()
                .map(|key| (key, AgentState::Pending))
                .collect(),
            quality_score: None,
            strategy: None,
            last_error: None,
        }
    }
}

/// One input image and its processing attempt.
///
/// This is plain data: the live worker handle is kept by the registry, so a
/// clone of `Job` is what callers and subscribers receive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub batch_id: Option<String>,
    pub input_path: PathBuf,
    pub output_dir: Option<PathBuf>,
    pub output_path: Option<PathBuf>,
    pub instructions: Option<String>,
    pub mode: String,
    pub status: JobStatus,
    pub progress: ProgressSnapshot,
    pub failure: Option<FailureKind>,
    /// `Some(false)` when the worker finished below its quality threshold.
    pub quality_passed: Option<bool>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// The public view of a job.
pub type JobSnapshot = Job;

impl Job {
    pub fn new(input_path: PathBuf, mode: String, instructions: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            batch_id: None,
            input_path,
            output_dir: None,
            output_path: None,
            instructions,
            mode,
            status: JobStatus::Pending,
            progress: ProgressSnapshot::default(),
            failure: None,
            quality_passed: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        }
    }

    pub fn in_batch(mut self, batch_id: &str) -> Self {
        self.batch_id = Some(batch_id.to_string());
        self
    }

    pub fn file_name(&self) -> String {
        self.input_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.input_path.display().to_string())
    }

    /// Wall time between spawn and the terminal transition, if both happened.
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}
