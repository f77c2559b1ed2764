//! Batch admission: directory enumeration and the per-batch concurrency cap.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::OrchestratorError;
use crate::state_machine::{Job, JobId, JobStatus};

/// Extensions (lowercase) a batch picks up.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];

pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|allowed| ext.eq_ignore_ascii_case(allowed))
        })
}

/// Lists the supported images directly inside `dir` (no recursion), sorted by
/// path so arrival order is stable.
pub async fn enumerate_inputs(dir: &Path) -> Result<Vec<PathBuf>, OrchestratorError> {
    let is_dir = tokio::fs::metadata(dir)
        .await
        .is_ok_and(|meta| meta.is_dir());
    if !is_dir {
        return Err(OrchestratorError::InputNotFound(dir.to_path_buf()));
    }

    let mut inputs = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_file() && is_supported_image(&path) {
            inputs.push(path);
        }
    }
    inputs.sort();

    if inputs.is_empty() {
        return Err(OrchestratorError::NoInputs(dir.to_path_buf()));
    }
    Ok(inputs)
}

/// Caller-supplied knobs for one batch.
#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    pub instructions: Option<String>,
    pub mode: Option<String>,
    /// Overrides the configured cap for this batch.
    pub max_concurrent: Option<usize>,
}

/// What `start_batch` hands back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchHandle {
    pub batch_id: String,
    pub job_ids: Vec<JobId>,
}

/// Counts over the jobs of one batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSummary {
    pub batch_id: String,
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Completed jobs whose worker reported meeting its quality threshold.
    pub passed_quality: usize,
    pub success_rate: f64,
}

impl BatchSummary {
    pub fn from_jobs<'a>(batch_id: &str, jobs: impl IntoIterator<Item = &'a Job>) -> Self {
        let mut summary = BatchSummary {
            batch_id: batch_id.to_string(),
            total: 0,
            pending: 0,
            running: 0,
            completed: 0,
            failed: 0,
            cancelled: 0,
            passed_quality: 0,
            success_rate: 0.0,
        };
        for job in jobs {
            summary.total += 1;
            match job.status {
                JobStatus::Pending => summary.pending += 1,
                JobStatus::Running => summary.running += 1,
                JobStatus::Completed => {
                    summary.completed += 1;
                    if job.quality_passed == Some(true) {
                        summary.passed_quality += 1;
                    }
                }
                JobStatus::Failed => summary.failed += 1,
                JobStatus::Cancelled => summary.cancelled += 1,
            }
        }
        if summary.total > 0 {
            summary.success_rate = summary.passed_quality as f64 / summary.total as f64;
        }
        summary
    }

    pub fn is_finished(&self) -> bool {
        self.pending == 0 && self.running == 0
    }
}

#[derive(Debug)]
struct BatchInfo {
    job_ids: Vec<JobId>,
    max_concurrent: usize,
}

#[derive(Debug)]
struct QueuedJob {
    job_id: JobId,
    batch_id: String,
}

/// Queue of batch jobs waiting for a worker slot.
///
/// Each batch has its own cap. Jobs leave the queue in arrival order within
/// their batch; a full batch does not hold back jobs of another batch.
#[derive(Debug, Default)]
pub struct BatchDispatcher {
    queue: VecDeque<QueuedJob>,
    batches: HashMap<String, BatchInfo>,
}

impl BatchDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue_batch(&mut self, batch_id: &str, max_concurrent: usize, job_ids: Vec<JobId>) {
        for job_id in &job_ids {
            self.queue.push_back(QueuedJob {
                job_id: job_id.clone(),
                batch_id: batch_id.to_string(),
            });
        }
        self.batches.insert(
            batch_id.to_string(),
            BatchInfo {
                job_ids,
                max_concurrent: max_concurrent.max(1),
            },
        );
    }

    /// Pops the first queued job whose batch still has a free slot.
    /// `live_in_batch` reports how many workers a batch currently holds.
    pub fn next_admissible(&mut self, live_in_batch: impl Fn(&str) -> usize) -> Option<JobId> {
        let pos = self.queue.iter().position(|queued| {
            self.batches
                .get(&queued.batch_id)
                .is_some_and(|batch| live_in_batch(&queued.batch_id) < batch.max_concurrent)
        })?;
        self.queue.remove(pos).map(|queued| queued.job_id)
    }

    pub fn remove_queued(&mut self, job_id: &str) -> bool {
        match self.queue.iter().position(|queued| queued.job_id == job_id) {
            Some(pos) => {
                self.queue.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Empties the queue, returning the ids that never got a worker.
    pub fn drain(&mut self) -> Vec<JobId> {
        self.queue.drain(..).map(|queued| queued.job_id).collect()
    }

    pub fn batch_jobs(&self, batch_id: &str) -> Option<&[JobId]> {
        self.batches.get(batch_id).map(|batch| batch.job_ids.as_slice())
    }
}
