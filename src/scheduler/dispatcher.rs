use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify, RwLock};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::config::DispatchConfig;
use crate::error::{ProvisionerError, Result};
use crate::protocol::ServerChannel;
use crate::provisioner::{JobOutcome, ProvisionerSession, SessionTimeouts};
use crate::scheduler::assigner::{Assignment, JobAssigner, WorkerSnapshot};
use crate::scheduler::events::LogEvent;
use crate::scheduler::job::{
    ArchiveRef, Job, JobId, JobInput, JobKind, JobSnapshot, JobStatus, ParameterValue, WorkerId,
};
use crate::scheduler::queue::JobQueue;

/// Queue and session registry, guarded together so that binding a job to
/// a session is a single atomic step.
#[derive(Debug)]
pub struct SchedulerState {
    pub queue: JobQueue,
    pub assigner: JobAssigner,
}

/// A request to run a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitJob {
    pub kind: JobKind,
    pub archive: ArchiveRef,
    #[serde(default)]
    pub parameters: Vec<ParameterValue>,
    #[serde(default)]
    pub required_tags: BTreeSet<String>,
}

/// Matches pending jobs to connected provisioner sessions and applies
/// the outcome of every exchange.
///
/// Assignment is triggered by job submission, session registration and
/// session release, with a periodic scan in [`Dispatcher::run`] as a
/// safety net.
#[derive(Debug)]
pub struct Dispatcher {
    state: Arc<RwLock<SchedulerState>>,
    config: DispatchConfig,
    closed_tx: mpsc::UnboundedSender<WorkerId>,
    closed_rx: Mutex<Option<mpsc::UnboundedReceiver<WorkerId>>>,
    wake: Notify,
}

impl Dispatcher {
    pub fn new(config: DispatchConfig) -> Arc<Self> {
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            state: Arc::new(RwLock::new(SchedulerState {
                queue: JobQueue::with_capacity(config.max_jobs),
                assigner: JobAssigner::new(),
            })),
            config,
            closed_tx,
            closed_rx: Mutex::new(Some(closed_rx)),
            wake: Notify::new(),
        })
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Shared scheduler state, for inspection.
    pub fn state(&self) -> Arc<RwLock<SchedulerState>> {
        self.state.clone()
    }

    /// Validate and enqueue a job, then try to assign it right away.
    pub async fn submit_job(self: &Arc<Self>, request: SubmitJob) -> Result<JobId> {
        self.validate(&request)?;

        let job = Job::new(
            request.kind,
            JobInput {
                archive: request.archive,
                parameters: request.parameters,
            },
            request.required_tags,
            &self.config.events,
        );
        let job_id = job.id;
        let kind = job.kind;

        {
            let mut state = self.state.write().await;
            if !state.queue.add_job(job) {
                tracing::warn!(job_id = %job_id, "Job queue at capacity, job rejected");
                return Err(ProvisionerError::QueueFull);
            }
        }
        tracing::info!(job_id = %job_id, kind = %kind, "Job submitted");

        self.dispatch_pending().await;
        Ok(job_id)
    }

    fn validate(&self, request: &SubmitJob) -> Result<()> {
        if request.archive.hash.trim().is_empty() {
            return Err(ProvisionerError::InvalidInput(
                "archive hash must not be empty".to_string(),
            ));
        }
        if request.archive.size_bytes > self.config.max_archive_bytes {
            return Err(ProvisionerError::ArchiveTooLarge {
                size: request.archive.size_bytes,
                limit: self.config.max_archive_bytes,
            });
        }
        let mut seen = HashSet::new();
        for param in &request.parameters {
            if param.name.is_empty() {
                return Err(ProvisionerError::InvalidInput(
                    "parameter name must not be empty".to_string(),
                ));
            }
            if !seen.insert(param.name.as_str()) {
                return Err(ProvisionerError::InvalidInput(format!(
                    "duplicate parameter: {}",
                    param.name
                )));
            }
        }
        if request.required_tags.iter().any(|t| t.trim().is_empty()) {
            return Err(ProvisionerError::InvalidInput(
                "required tags must not be empty strings".to_string(),
            ));
        }
        Ok(())
    }

    /// Copy of a job. Reading a terminal job marks its result as read,
    /// which makes it eligible for garbage collection.
    pub async fn get_job(&self, id: JobId) -> Result<JobSnapshot> {
        let mut state = self.state.write().await;
        let job = state
            .queue
            .get_job_mut(&id)
            .ok_or(ProvisionerError::JobNotFound(id))?;
        if job.status.is_terminal() {
            job.result_read = true;
        }
        Ok(job.snapshot())
    }

    /// Every tracked job, oldest first. Does not mark results as read.
    pub async fn list_jobs(&self) -> Vec<JobSnapshot> {
        let state = self.state.read().await;
        state.queue.all_jobs().into_iter().map(Job::snapshot).collect()
    }

    /// Stream a job's events from `from_sequence` onwards.
    ///
    /// The stream follows the job live and ends after the job is terminal
    /// and every retained event has been delivered. Calling again with the
    /// last seen sequence plus one resumes without gaps.
    pub async fn stream_events(
        &self,
        id: JobId,
        from_sequence: u64,
    ) -> Result<ReceiverStream<LogEvent>> {
        let events = {
            let state = self.state.read().await;
            state
                .queue
                .get_job(&id)
                .ok_or(ProvisionerError::JobNotFound(id))?
                .events
                .clone()
        };
        Ok(events.stream(from_sequence))
    }

    /// Request cancellation.
    ///
    /// Pending jobs are canceled immediately. Running jobs move to
    /// canceling and their session forwards the request to the worker.
    /// Jobs already canceling or terminal are left untouched.
    pub async fn cancel_job(&self, id: JobId) -> Result<()> {
        let mut state = self.state.write().await;
        let job = state
            .queue
            .get_job_mut(&id)
            .ok_or(ProvisionerError::JobNotFound(id))?;
        let previous = job.status;
        if job.request_cancel()? {
            tracing::info!(job_id = %id, from = %previous, to = %job.status, "Cancellation requested");
            if previous == JobStatus::Pending {
                state.queue.remove_pending(&id);
            }
        } else {
            tracing::debug!(job_id = %id, status = %previous, "Cancellation ignored");
        }
        Ok(())
    }

    /// Register a connected worker and start its session.
    pub async fn register_worker(
        self: &Arc<Self>,
        name: impl Into<String>,
        tags: impl IntoIterator<Item = String>,
        channel: ServerChannel,
    ) -> WorkerId {
        let worker_id = uuid::Uuid::new_v4();
        let name = name.into();
        let tags: BTreeSet<String> = tags
            .into_iter()
            .filter(|t| {
                let keep = !t.trim().is_empty();
                if !keep {
                    tracing::warn!(worker_id = %worker_id, "Ignoring empty worker tag");
                }
                keep
            })
            .collect();

        let session = ProvisionerSession::connect(
            worker_id,
            channel,
            self.closed_tx.clone(),
            SessionTimeouts::from(&self.config),
        );
        self.state
            .write()
            .await
            .assigner
            .register(name, tags, session);

        self.dispatch_pending().await;
        worker_id
    }

    pub async fn deregister(&self, worker_id: WorkerId) -> Result<()> {
        self.state.write().await.assigner.deregister(worker_id)
    }

    pub async fn list_workers(&self) -> Vec<WorkerSnapshot> {
        self.state.read().await.assigner.workers()
    }

    /// Bind as many pending jobs to idle sessions as possible and start
    /// executing them. Returns the number of jobs assigned.
    pub async fn dispatch_pending(self: &Arc<Self>) -> usize {
        let assignments = {
            let mut state = self.state.write().await;
            let SchedulerState { queue, assigner } = &mut *state;
            if assigner.idle_count() == 0 {
                return 0;
            }
            let mut assignments = Vec::new();
            while let Some(assignment) = assigner.assign_next_job(queue) {
                assignments.push(assignment);
            }
            assignments
        };

        let count = assignments.len();
        for assignment in assignments {
            tokio::spawn(Arc::clone(self).execute(assignment));
        }
        count
    }

    async fn execute(self: Arc<Self>, assignment: Assignment) {
        let Assignment {
            job_id,
            worker_id,
            mut session,
            execution,
        } = assignment;

        let outcome = session.run(&execution).await;
        self.finish(job_id, worker_id, session, outcome).await;

        // The session may be idle again
        self.wake.notify_one();
    }

    /// Apply an exchange outcome to its job and hand the session back.
    async fn finish(
        &self,
        job_id: JobId,
        worker_id: WorkerId,
        session: ProvisionerSession,
        outcome: JobOutcome,
    ) {
        let mut state = self.state.write().await;

        match state.queue.get_job_mut(&job_id) {
            Some(job) => {
                let applied = match outcome {
                    JobOutcome::Succeeded(result) => job.succeed(result),
                    JobOutcome::Canceled => job.mark_canceled(),
                    JobOutcome::Failed(error) => {
                        tracing::warn!(job_id = %job_id, worker_id = %worker_id, error = %error, "Job failed");
                        job.fail(error)
                    }
                };
                match applied {
                    Ok(()) => {
                        tracing::info!(job_id = %job_id, worker_id = %worker_id, status = %job.status, "Job finished")
                    }
                    Err(e) => {
                        tracing::error!(job_id = %job_id, worker_id = %worker_id, error = %e, "Failed to apply job outcome")
                    }
                }
            }
            None => {
                tracing::error!(job_id = %job_id, worker_id = %worker_id, "Finished job is no longer tracked")
            }
        }

        state.assigner.release(worker_id, job_id, session);
    }

    /// The connection behind `worker_id` is gone.
    ///
    /// An idle session is dropped from the registry. A busy one is marked
    /// closed: its running exchange observes the loss itself, fails the job
    /// with `ConnectionLost` and the session is removed on release.
    pub async fn handle_session_closed(&self, worker_id: WorkerId) {
        let running = self.state.write().await.assigner.mark_closed(worker_id);
        if let Some(job_id) = running {
            tracing::warn!(worker_id = %worker_id, job_id = %job_id, "Worker connection lost while running a job");
        }
    }

    /// Drop terminal jobs whose result was read more than `job_retention`
    /// ago. Returns the number of jobs removed.
    pub async fn collect_garbage(&self) -> usize {
        let retention = chrono::Duration::from_std(self.config.job_retention)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let cutoff = Utc::now() - retention;
        let removed = self.state.write().await.queue.cleanup_finished_jobs(cutoff);
        if removed > 0 {
            tracing::debug!(removed, "Removed finished jobs");
        }
        removed
    }

    /// Ask every running job to cancel. Used on shutdown.
    pub async fn cancel_active_jobs(&self) -> usize {
        let mut state = self.state.write().await;
        let active: Vec<JobId> = state.queue.active_jobs().iter().map(|j| j.id).collect();
        let mut canceled = 0;
        for id in active {
            if let Some(job) = state.queue.get_job_mut(&id) {
                match job.request_cancel() {
                    Ok(true) => canceled += 1,
                    Ok(false) => {}
                    Err(e) => tracing::warn!(job_id = %id, error = %e, "Failed to cancel job"),
                }
            }
        }
        canceled
    }

    /// Background loop of the dispatcher.
    ///
    /// ## Triggers
    /// - a worker connection closed: update the session registry
    /// - a session was released: re-run assignment
    /// - `dispatch_interval`: re-run assignment as a safety net
    /// - `gc_interval`: drop old, already-read terminal jobs
    ///
    /// On shutdown, running jobs are asked to cancel and the loop returns.
    /// Only one loop may run per dispatcher.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let closed_rx = self
            .closed_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(mut closed_rx) = closed_rx else {
            tracing::error!("Dispatcher loop is already running");
            return;
        };

        let mut dispatch_interval = tokio::time::interval(self.config.dispatch_interval);
        let mut gc_interval = tokio::time::interval(self.config.gc_interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let canceled = self.cancel_active_jobs().await;
                    tracing::info!(canceled, "Dispatcher shutting down");
                    break;
                }

                Some(worker_id) = closed_rx.recv() => {
                    self.handle_session_closed(worker_id).await;
                }

                _ = self.wake.notified() => {
                    self.dispatch_pending().await;
                }

                _ = dispatch_interval.tick() => {
                    self.dispatch_pending().await;
                }

                _ = gc_interval.tick() => {
                    self.collect_garbage().await;
                }
            }
        }
    }
}
