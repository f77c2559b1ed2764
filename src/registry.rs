//! Canonical job table plus the internal table of live worker bindings.

use std::collections::HashMap;

use crate::state_machine::{Job, JobId};
use crate::worker::WorkerHandle;

/// A live worker attached to a job. `generation` tells reports from an old
/// process apart from the current one.
#[derive(Debug)]
pub struct WorkerBinding {
    pub generation: u64,
    pub handle: WorkerHandle,
    /// Set once the job was cancelled or timed out; later output and the exit
    /// notification no longer touch the job.
    pub cancelled: bool,
}

#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: HashMap<JobId, Job>,
    order: Vec<JobId>,
    bindings: HashMap<JobId, WorkerBinding>,
    next_generation: u64,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, job: Job) {
        if !self.jobs.contains_key(&job.id) {
            self.order.push(job.id.clone());
        }
        self.jobs.insert(job.id.clone(), job);
    }

    pub fn get(&self, job_id: &str) -> Option<&Job> {
        self.jobs.get(job_id)
    }

    pub fn get_mut(&mut self, job_id: &str) -> Option<&mut Job> {
        self.jobs.get_mut(job_id)
    }

    /// Snapshots in creation order.
    pub fn list(&self) -> Vec<Job> {
        self.order
            .iter()
            .filter_map(|id| self.jobs.get(id))
            .cloned()
            .collect()
    }

    pub fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Attaches a live worker. Refuses when the job already has one.
    pub fn bind(&mut self, job_id: &str, generation: u64, handle: WorkerHandle) -> bool {
        if self.bindings.contains_key(job_id) || !self.jobs.contains_key(job_id) {
            return false;
        }
        self.bindings.insert(
            job_id.to_string(),
            WorkerBinding {
                generation,
                handle,
                cancelled: false,
            },
        );
        true
    }

    /// The binding for `job_id`, but only if it belongs to `generation`.
    pub fn binding(&self, job_id: &str, generation: u64) -> Option<&WorkerBinding> {
        self.bindings
            .get(job_id)
            .filter(|binding| binding.generation == generation)
    }

    pub fn binding_mut(&mut self, job_id: &str) -> Option<&mut WorkerBinding> {
        self.bindings.get_mut(job_id)
    }

    pub fn unbind(&mut self, job_id: &str, generation: u64) -> Option<WorkerBinding> {
        if self.binding(job_id, generation).is_none() {
            return None;
        }
        self.bindings.remove(job_id)
    }

    pub fn live_count(&self) -> usize {
        self.bindings.len()
    }

    pub fn live_ids(&self) -> Vec<JobId> {
        self.bindings.keys().cloned().collect()
    }

    pub fn live_in_batch(&self, batch_id: &str) -> usize {
        self.bindings
            .keys()
            .filter_map(|id| self.jobs.get(id))
            .filter(|job| job.batch_id.as_deref() == Some(batch_id))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(batch: Option<&str>) -> Job {
        let job = Job::new("/tmp/a.jpg".into(), "process".into(), None);
        match batch {
            Some(batch_id) => job.in_batch(batch_id),
            None => job,
        }
    }

    #[cfg(unix)]
    fn live_handle() -> WorkerHandle {
        let mut command = tokio::process::Command::new("sh");
        command.arg("-c").arg("exec sleep 5").kill_on_drop(true);
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        crate::worker::spawn_worker(command, "test".into(), 0, tx).unwrap()
    }

    #[test]
    fn list_keeps_creation_order() {
        let mut registry = JobRegistry::new();
        let ids: Vec<_> = (0..5)
            .map(|_| {
                let job = job(None);
                let id = job.id.clone();
                registry.insert(job);
                id
            })
            .collect();
        let listed: Vec<_> = registry.list().into_iter().map(|j| j.id).collect();
        assert_eq!(listed, ids);
    }

    #[test]
    fn reinserting_replaces_without_duplicating() {
        let mut registry = JobRegistry::new();
        let mut first = job(None);
        let id = first.id.clone();
        registry.insert(first.clone());
        first.mode = "batch".into();
        registry.insert(first);
        assert_eq!(registry.list().len(), 1);
        assert_eq!(registry.get(&id).unwrap().mode, "batch");
    }

    #[test]
    fn generations_increase() {
        let mut registry = JobRegistry::new();
        let a = registry.next_generation();
        let b = registry.next_generation();
        assert!(b > a);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn one_live_binding_per_job() {
        let mut registry = JobRegistry::new();
        let first = job(Some("b1"));
        let id = first.id.clone();
        registry.insert(first);
        registry.insert(job(Some("b2")));

        assert!(registry.bind(&id, 1, live_handle()));
        assert!(!registry.bind(&id, 2, live_handle()));
        assert!(!registry.bind("unknown", 3, live_handle()));
        assert_eq!(registry.live_count(), 1);
        assert_eq!(registry.live_in_batch("b1"), 1);
        assert_eq!(registry.live_in_batch("b2"), 0);

        assert!(registry.binding(&id, 2).is_none());
        assert!(registry.unbind(&id, 2).is_none());
        assert_eq!(registry.live_ids(), vec![id.clone()]);

        let binding = registry.unbind(&id, 1).unwrap();
        assert!(!binding.cancelled);
        assert_eq!(registry.live_count(), 0);
    }
}
