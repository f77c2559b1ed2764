use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::dispatcher::{self, BatchDispatcher, BatchHandle, BatchOptions, BatchSummary};
use crate::error::{FailureKind, OrchestratorError};
use crate::events::{EventBroadcaster, EventKind, JobEvent};
use crate::protocol::ParsedLine;
use crate::registry::JobRegistry;
use crate::state_machine::{Job, JobId, JobStatus, StateMachine, Transition};
use crate::worker::{self, WorkerCommand, WorkerMessage, WorkerReport};

pub const CANCELLED_BY_USER: &str = "Cancelled by user";
pub const CANCELLED_ON_SHUTDOWN: &str = "Cancelled: orchestrator shutting down";

/// A request to edit one image.
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    pub input_path: PathBuf,
    pub instructions: Option<String>,
    /// Worker mode; the configured default when `None`.
    pub mode: Option<String>,
}

impl StartRequest {
    pub fn new(input_path: impl Into<PathBuf>) -> Self {
        Self {
            input_path: input_path.into(),
            ..Default::default()
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = Some(mode.into());
        self
    }
}

enum Command {
    Start {
        request: StartRequest,
        reply: oneshot::Sender<Result<JobId, OrchestratorError>>,
    },
    StartBatch {
        dir: PathBuf,
        options: BatchOptions,
        reply: oneshot::Sender<Result<BatchHandle, OrchestratorError>>,
    },
    Cancel {
        job_id: JobId,
        reply: oneshot::Sender<bool>,
    },
    Status {
        job_id: JobId,
        reply: oneshot::Sender<Option<Job>>,
    },
    List {
        reply: oneshot::Sender<Vec<Job>>,
    },
    Summary {
        batch_id: String,
        reply: oneshot::Sender<Option<BatchSummary>>,
    },
    LiveWorkers {
        reply: oneshot::Sender<usize>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to the coordinator.
///
/// The coordinator is a single tokio task that owns the job registry, the
/// batch queue and the state machine. Handles talk to it over a channel, so
/// several orchestrators can live side by side without sharing state. When the
/// last handle is dropped the coordinator kills its workers and stops.
#[derive(Clone)]
pub struct Orchestrator {
    commands: mpsc::UnboundedSender<Command>,
    events: Arc<EventBroadcaster>,
}

impl Orchestrator {
    /// Spawns the coordinator on the current tokio runtime.
    pub fn new(config: OrchestratorConfig) -> Self {
        let events = Arc::new(EventBroadcaster::new());
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();

        let coordinator = Coordinator {
            worker: WorkerCommand::from_config(&config),
            config,
            registry: JobRegistry::new(),
            dispatcher: BatchDispatcher::new(),
            events: Arc::clone(&events),
            reports_tx,
        };
        tokio::spawn(coordinator.run(commands_rx, reports_rx));

        Self {
            commands: commands_tx,
            events,
        }
    }

    /// Validates the input and spawns its worker right away.
    ///
    /// `InputNotFound` and `SpawnFailure` come back here; everything after the
    /// spawn is reported through the event subscriptions.
    pub async fn start(&self, request: StartRequest) -> Result<JobId, OrchestratorError> {
        self.request(|reply| Command::Start { request, reply })
            .await?
    }

    /// Queues every supported image in `dir` and admits them under the
    /// batch's concurrency cap.
    pub async fn start_batch(
        &self,
        dir: impl Into<PathBuf>,
        options: BatchOptions,
    ) -> Result<BatchHandle, OrchestratorError> {
        let dir = dir.into();
        self.request(|reply| Command::StartBatch {
            dir,
            options,
            reply,
        })
        .await?
    }

    /// Returns false when the job already finished or has neither a live
    /// worker nor a queue slot.
    pub async fn cancel(&self, job_id: &str) -> bool {
        let job_id = job_id.to_string();
        self.request(|reply| Command::Cancel { job_id, reply })
            .await
            .unwrap_or(false)
    }

    pub async fn get_status(&self, job_id: &str) -> Option<Job> {
        let job_id = job_id.to_string();
        self.request(|reply| Command::Status { job_id, reply })
            .await
            .ok()
            .flatten()
    }

    pub async fn list_jobs(&self) -> Vec<Job> {
        self.request(|reply| Command::List { reply })
            .await
            .unwrap_or_default()
    }

    pub async fn batch_summary(&self, batch_id: &str) -> Option<BatchSummary> {
        let batch_id = batch_id.to_string();
        self.request(|reply| Command::Summary { batch_id, reply })
            .await
            .ok()
            .flatten()
    }

    /// Number of worker processes that have not exited yet.
    pub async fn live_workers(&self) -> usize {
        self.request(|reply| Command::LiveWorkers { reply })
            .await
            .unwrap_or(0)
    }

    /// Kills every worker, cancels queued jobs and stops the coordinator.
    pub async fn shutdown(&self) {
        let _ = self.request(|reply| Command::Shutdown { reply }).await;
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<JobEvent> {
        self.events.subscribe()
    }

    pub fn on_progress(&self) -> mpsc::UnboundedReceiver<JobEvent> {
        self.events.subscribe_to(EventKind::Progress)
    }

    pub fn on_completed(&self) -> mpsc::UnboundedReceiver<JobEvent> {
        self.events.subscribe_to(EventKind::Completed)
    }

    pub fn on_error(&self) -> mpsc::UnboundedReceiver<JobEvent> {
        self.events.subscribe_to(EventKind::Error)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, OrchestratorError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| OrchestratorError::CoordinatorClosed)?;
        rx.await.map_err(|_| OrchestratorError::CoordinatorClosed)
    }
}

struct Coordinator {
    config: OrchestratorConfig,
    worker: WorkerCommand,
    registry: JobRegistry,
    dispatcher: BatchDispatcher,
    events: Arc<EventBroadcaster>,
    reports_tx: mpsc::UnboundedSender<WorkerReport>,
}

impl Coordinator {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut reports: mpsc::UnboundedReceiver<WorkerReport>,
    ) {
        debug!(worker = %self.worker.describe(), "coordinator started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command).await {
                            break;
                        }
                    }
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                Some(report) = reports.recv() => self.handle_report(report).await,
            }
        }
        debug!("coordinator stopped");
    }

    /// Returns false once the coordinator should stop.
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Start { request, reply } => {
                let _ = reply.send(self.start_single(request).await);
            }
            Command::StartBatch {
                dir,
                options,
                reply,
            } => {
                let _ = reply.send(self.start_batch(&dir, options).await);
            }
            Command::Cancel { job_id, reply } => {
                let _ = reply.send(self.cancel(&job_id, CANCELLED_BY_USER));
            }
            Command::Status { job_id, reply } => {
                let _ = reply.send(self.registry.get(&job_id).cloned());
            }
            Command::List { reply } => {
                let _ = reply.send(self.registry.list());
            }
            Command::Summary { batch_id, reply } => {
                let _ = reply.send(self.summary(&batch_id));
            }
            Command::LiveWorkers { reply } => {
                let _ = reply.send(self.registry.live_count());
            }
            Command::Shutdown { reply } => {
                self.shutdown();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    async fn start_single(&mut self, request: StartRequest) -> Result<JobId, OrchestratorError> {
        if !path_exists(&request.input_path).await {
            return Err(OrchestratorError::InputNotFound(request.input_path));
        }

        let mode = request
            .mode
            .unwrap_or_else(|| self.config.default_mode.clone());
        let job = Job::new(request.input_path, mode, request.instructions);
        let job_id = job.id.clone();
        self.registry.insert(job);
        self.publish(&job_id, EventKind::Progress, None);

        self.launch(&job_id).await?;
        Ok(job_id)
    }

    async fn start_batch(
        &mut self,
        dir: &Path,
        options: BatchOptions,
    ) -> Result<BatchHandle, OrchestratorError> {
        let inputs = dispatcher::enumerate_inputs(dir).await?;
        let batch_id = Uuid::new_v4().to_string();
        let max_concurrent = options
            .max_concurrent
            .unwrap_or(self.config.max_concurrent)
            .max(1);
        let mode = options
            .mode
            .unwrap_or_else(|| self.config.default_mode.clone());

        let mut job_ids = Vec::with_capacity(inputs.len());
        for input in inputs {
            let job = Job::new(input, mode.clone(), options.instructions.clone()).in_batch(&batch_id);
            job_ids.push(job.id.clone());
            self.registry.insert(job);
        }
        for job_id in &job_ids {
            self.publish(job_id, EventKind::Progress, None);
        }

        self.dispatcher
            .enqueue_batch(&batch_id, max_concurrent, job_ids.clone());
        info!(
            batch_id = %batch_id,
            jobs = job_ids.len(),
            max_concurrent,
            dir = %dir.display(),
            "batch queued"
        );
        self.admit().await;

        Ok(BatchHandle { batch_id, job_ids })
    }

    /// Spawns the worker for a pending job. On failure the job is already
    /// marked failed and published when this returns.
    async fn launch(&mut self, job_id: &str) -> Result<(), OrchestratorError> {
        let Some(job) = self.registry.get(job_id) else {
            return Err(OrchestratorError::JobNotFound(job_id.to_string()));
        };
        let input = job.input_path.clone();
        let mode = job.mode.clone();
        let instructions = job.instructions.clone();

        if !path_exists(&input).await {
            self.finish_failed(
                job_id,
                FailureKind::InputMissing,
                format!("Input not found: {}", input.display()),
            );
            return Err(OrchestratorError::InputNotFound(input));
        }

        let output_dir = worker::output_dir_for(self.config.output_dir.as_deref(), &input);
        if let Err(source) = tokio::fs::create_dir_all(&output_dir).await {
            warn!(job_id, dir = %output_dir.display(), error = %source, "cannot create output directory");
            self.finish_failed(
                job_id,
                FailureKind::Spawn {
                    reason: source.to_string(),
                },
                format!("Could not create output directory: {source}"),
            );
            return Err(OrchestratorError::OutputDirectory {
                path: output_dir,
                source,
            });
        }

        let args = self
            .worker
            .argv(&mode, &input, &output_dir, instructions.as_deref());
        let generation = self.registry.next_generation();
        let spawned = worker::spawn_worker(
            self.worker.command(&args),
            job_id.to_string(),
            generation,
            self.reports_tx.clone(),
        );

        match spawned {
            Ok(handle) => {
                let pid = handle.pid;
                let bound = self.registry.bind(job_id, generation, handle);
                debug_assert!(bound, "job {job_id} already had a live worker");
                if let Some(job) = self.registry.get_mut(job_id) {
                    job.output_dir = Some(output_dir);
                    StateMachine::mark_running(job);
                }
                info!(job_id, pid = ?pid, generation, input = %input.display(), "worker spawned");
                self.publish(job_id, EventKind::Progress, None);
                self.arm_watchdog(job_id, generation);
                Ok(())
            }
            Err(source) => {
                let command = self.worker.describe();
                error!(job_id, command = %command, error = %source, "failed to spawn worker");
                self.finish_failed(
                    job_id,
                    FailureKind::Spawn {
                        reason: source.to_string(),
                    },
                    format!("Failed to start worker: {source}"),
                );
                Err(OrchestratorError::SpawnFailure {
                    job_id: job_id.to_string(),
                    command,
                    source,
                })
            }
        }
    }

    /// Starts queued batch jobs while their batches have free slots.
    async fn admit(&mut self) {
        while let Some(job_id) = self
            .dispatcher
            .next_admissible(|batch| self.registry.live_in_batch(batch))
        {
            if let Err(err) = self.launch(&job_id).await {
                warn!(job_id = %job_id, error = %err, "batch job could not be started");
            }
        }
    }

    fn arm_watchdog(&self, job_id: &str, generation: u64) {
        let Some(secs) = self.config.max_job_duration_secs else {
            return;
        };
        let reports = self.reports_tx.clone();
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            let _ = reports.send(WorkerReport {
                job_id,
                generation,
                message: WorkerMessage::DeadlineElapsed,
            });
        });
    }

    async fn handle_report(&mut self, report: WorkerReport) {
        let WorkerReport {
            job_id,
            generation,
            message,
        } = report;

        let Some(binding) = self.registry.binding(&job_id, generation) else {
            debug!(job_id = %job_id, generation, "dropping report from a finished worker");
            return;
        };
        let cancelled = binding.cancelled;

        match message {
            WorkerMessage::Exited(code) => self.on_exit(&job_id, generation, code).await,
            // Once cancelled, nothing the process says matters.
            _ if cancelled => {}
            WorkerMessage::Line(parsed) => self.on_line(&job_id, parsed),
            WorkerMessage::Stderr(text) => {
                warn!(job_id = %job_id, line = %text, "worker stderr");
                self.publish(&job_id, EventKind::Error, Some(text));
            }
            WorkerMessage::DeadlineElapsed => self.on_deadline(&job_id),
        }
    }

    fn on_line(&mut self, job_id: &str, parsed: ParsedLine) {
        let event = match parsed {
            ParsedLine::Event(event) => event,
            ParsedLine::Diagnostic {
                text,
                parse_error: Some(err),
            } => {
                debug!(job_id, line = %text, error = %err, "unparseable worker record");
                return;
            }
            ParsedLine::Diagnostic { text, .. } => {
                debug!(job_id, line = %text, "worker output");
                return;
            }
        };

        let Some(job) = self.registry.get_mut(job_id) else {
            return;
        };
        let transition = StateMachine::apply(job, &event);
        if transition == Transition::Ignored {
            debug!(job_id, "record after terminal status ignored");
            return;
        }

        if let Some(error) = event.error {
            self.publish(job_id, EventKind::Error, Some(error));
        }
        self.publish_transition(job_id, transition);
    }

    async fn on_exit(&mut self, job_id: &str, generation: u64, code: Option<i32>) {
        let Some(binding) = self.registry.unbind(job_id, generation) else {
            return;
        };

        if binding.cancelled {
            debug!(job_id, exit_code = ?code, "cancelled worker exited");
        } else if let Some(job) = self.registry.get_mut(job_id) {
            let transition = StateMachine::on_exit(job, code);
            info!(job_id, exit_code = ?code, status = %job.status, "worker exited");

            let discovered = self.discover_output(job_id).await;
            match transition {
                Transition::Ignored if discovered => {
                    self.publish(job_id, EventKind::Progress, None);
                }
                transition => self.publish_transition(job_id, transition),
            }
        }

        self.admit().await;
    }

    fn on_deadline(&mut self, job_id: &str) {
        let after_secs = self.config.max_job_duration_secs.unwrap_or_default();
        let finished = self
            .registry
            .get(job_id)
            .is_some_and(|job| job.status.is_terminal());
        if let Some(binding) = self.registry.binding_mut(job_id) {
            // A completed job keeps its exit handling so the artifact scan runs.
            binding.cancelled = !finished;
            binding.handle.kill();
        }
        warn!(job_id, after_secs, "worker exceeded its time limit");
        if finished {
            return;
        }

        let failure = FailureKind::Timeout { after_secs };
        let message = failure.to_string();
        self.finish_failed(job_id, failure, message);
    }

    /// Best-effort: fills `output_path` of a completed job from its output
    /// directory. Returns true when a path was found.
    async fn discover_output(&mut self, job_id: &str) -> bool {
        let Some(job) = self.registry.get(job_id) else {
            return false;
        };
        if job.status != JobStatus::Completed || job.output_path.is_some() {
            return false;
        }
        let Some(dir) = job.output_dir.clone() else {
            return false;
        };
        let input = job.input_path.clone();

        match worker::find_output_artifact(&dir, &input).await {
            Ok(Some(path)) => {
                debug!(job_id, output = %path.display(), "found worker artifact");
                if let Some(job) = self.registry.get_mut(job_id) {
                    job.output_path = Some(path);
                }
                true
            }
            Ok(None) => {
                debug!(job_id, dir = %dir.display(), "worker left no artifact");
                false
            }
            Err(err) => {
                warn!(job_id, dir = %dir.display(), error = %err, "could not scan output directory");
                false
            }
        }
    }

    fn cancel(&mut self, job_id: &str, message: &str) -> bool {
        if self.dispatcher.remove_queued(job_id) {
            if let Some(job) = self.registry.get_mut(job_id) {
                let transition = StateMachine::cancel(job, message);
                self.publish_transition(job_id, transition);
            }
            info!(job_id, "queued job cancelled");
            return true;
        }

        if self
            .registry
            .get(job_id)
            .is_some_and(|job| job.status.is_terminal())
        {
            debug!(job_id, "job already finished; nothing to cancel");
            return false;
        }
        let Some(binding) = self.registry.binding_mut(job_id) else {
            debug!(job_id, "no live worker to cancel");
            return false;
        };
        if binding.cancelled {
            return false;
        }
        binding.cancelled = true;
        binding.handle.kill();

        let transition = match self.registry.get_mut(job_id) {
            Some(job) => StateMachine::cancel(job, message),
            None => Transition::Ignored,
        };
        info!(job_id, reason = message, "worker cancelled");
        self.publish_transition(job_id, transition);
        true
    }

    fn shutdown(&mut self) {
        let queued = self.dispatcher.drain();
        for job_id in &queued {
            if let Some(job) = self.registry.get_mut(job_id) {
                let transition = StateMachine::cancel(job, CANCELLED_ON_SHUTDOWN);
                self.publish_transition(job_id, transition);
            }
        }

        let live = self.registry.live_ids();
        for job_id in &live {
            // Workers of already finished jobs are stopped without a status change.
            if !self.cancel(job_id, CANCELLED_ON_SHUTDOWN)
                && let Some(binding) = self.registry.binding_mut(job_id)
            {
                binding.handle.kill();
            }
        }
        info!(
            queued = queued.len(),
            live = live.len(),
            "orchestrator shutting down"
        );
    }

    fn summary(&self, batch_id: &str) -> Option<BatchSummary> {
        let job_ids = self.dispatcher.batch_jobs(batch_id)?;
        Some(BatchSummary::from_jobs(
            batch_id,
            job_ids.iter().filter_map(|id| self.registry.get(id)),
        ))
    }

    fn finish_failed(&mut self, job_id: &str, failure: FailureKind, message: String) {
        if let Some(job) = self.registry.get_mut(job_id) {
            let transition = StateMachine::fail(job, failure, message);
            self.publish_transition(job_id, transition);
        }
    }

    fn publish_transition(&self, job_id: &str, transition: Transition) {
        match transition {
            Transition::Ignored => {}
            Transition::Progress => self.publish(job_id, EventKind::Progress, None),
            Transition::Finished(JobStatus::Completed) => {
                self.publish(job_id, EventKind::Completed, None)
            }
            Transition::Finished(_) => {
                let message = self
                    .registry
                    .get(job_id)
                    .map(|job| job.progress.message.clone());
                self.publish(job_id, EventKind::Error, message);
            }
        }
    }

    fn publish(&self, job_id: &str, kind: EventKind, message: Option<String>) {
        if let Some(job) = self.registry.get(job_id) {
            self.events.publish(job, kind, message);
        }
    }
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}
