use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ProvisionerError, Result};
use crate::provisioner::{JobExecution, ProvisionerSession};
use crate::scheduler::job::{JobId, WorkerId};
use crate::scheduler::queue::JobQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Connected and free to take a job.
    Idle,
    /// Executing `current_job`.
    Busy,
    /// Deregistered while busy; removed once its job finishes.
    Draining,
    /// Connection lost while busy; removed once its job is resolved.
    Closed,
}

/// Registry entry for one connected worker.
#[derive(Debug)]
pub struct SessionEntry {
    pub worker_id: WorkerId,
    pub name: String,
    pub tags: BTreeSet<String>,
    pub state: SessionState,
    pub current_job: Option<JobId>,
    pub connected_at: DateTime<Utc>,
    /// Present while idle. Moved into the executing task while busy.
    session: Option<ProvisionerSession>,
}

impl SessionEntry {
    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.worker_id,
            name: self.name.clone(),
            tags: self.tags.clone(),
            state: self.state,
            current_job: self.current_job,
            connected_at: self.connected_at,
        }
    }

    fn is_available(&self) -> bool {
        self.state == SessionState::Idle
            && self.session.as_ref().is_some_and(|s| !s.is_closed())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub id: WorkerId,
    pub name: String,
    pub tags: BTreeSet<String>,
    pub state: SessionState,
    pub current_job: Option<JobId>,
    pub connected_at: DateTime<Utc>,
}

/// A job bound to a session, ready to execute outside the scheduler lock.
#[derive(Debug)]
pub struct Assignment {
    pub job_id: JobId,
    pub worker_id: WorkerId,
    pub session: ProvisionerSession,
    pub execution: JobExecution,
}

/// Tracks connected worker sessions and matches pending jobs to them.
#[derive(Debug, Default)]
pub struct JobAssigner {
    sessions: HashMap<WorkerId, SessionEntry>,
}

/// A worker can run a job when it offers every tag the job requires.
/// An empty requirement matches any worker.
pub fn tags_satisfy(required: &BTreeSet<String>, offered: &BTreeSet<String>) -> bool {
    required.is_subset(offered)
}

impl JobAssigner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an idle session to the registry.
    pub fn register(&mut self, name: String, tags: BTreeSet<String>, session: ProvisionerSession) {
        let worker_id = session.worker_id();
        tracing::info!(worker_id = %worker_id, name = %name, tags = ?tags, "Worker registered");
        self.sessions.insert(
            worker_id,
            SessionEntry {
                worker_id,
                name,
                tags,
                state: SessionState::Idle,
                current_job: None,
                connected_at: Utc::now(),
                session: Some(session),
            },
        );
    }

    /// Idle sessions able to run a job requiring `required`, oldest
    /// connection first.
    fn idle_matching(&self, required: &BTreeSet<String>) -> Option<WorkerId> {
        self.sessions
            .values()
            .filter(|e| e.is_available() && tags_satisfy(required, &e.tags))
            .min_by_key(|e| e.connected_at)
            .map(|e| e.worker_id)
    }

    /// Bind the oldest pending job that some idle session can run.
    ///
    /// Must be called with exclusive access to both the queue and the
    /// registry; the job leaves `Pending` and the session leaves `Idle`
    /// together. Pending jobs with no matching session are skipped, not
    /// failed.
    pub fn assign_next_job(&mut self, queue: &mut JobQueue) -> Option<Assignment> {
        let (job_id, worker_id) = queue
            .pending_jobs()
            .into_iter()
            .find_map(|job| self.idle_matching(&job.required_tags).map(|w| (job.id, w)))?;

        let entry = self.sessions.get_mut(&worker_id)?;
        if entry.current_job.is_some() {
            panic!(
                "worker {} is idle but already bound to job {:?}",
                worker_id, entry.current_job
            );
        }
        let job = queue.get_job_mut(&job_id)?;
        if let Err(e) = job.start(worker_id) {
            panic!("job {} was selected for assignment but cannot start: {}", job_id, e);
        }
        let Some(session) = entry.session.take() else {
            panic!("idle worker {} has no session", worker_id);
        };
        entry.state = SessionState::Busy;
        entry.current_job = Some(job_id);

        let kind = job.kind;
        let execution = JobExecution {
            job_id,
            kind,
            archive_hash: job.input.archive.hash.clone(),
            parameters: job.input.parameters.clone(),
            events: job.events.clone(),
            cancel: job.cancel_token(),
        };
        queue.remove_pending(&job_id);

        tracing::info!(job_id = %job_id, worker_id = %worker_id, kind = %kind, "Job assigned");
        Some(Assignment {
            job_id,
            worker_id,
            session,
            execution,
        })
    }

    /// Hand a session back after its job resolved.
    ///
    /// The session becomes idle again unless it was deregistered or its
    /// connection is gone, in which case it is dropped from the registry.
    pub fn release(&mut self, worker_id: WorkerId, job_id: JobId, session: ProvisionerSession) {
        let Some(entry) = self.sessions.get_mut(&worker_id) else {
            tracing::warn!(worker_id = %worker_id, job_id = %job_id, "Released session is not registered");
            return;
        };
        if entry.current_job != Some(job_id) {
            tracing::warn!(
                worker_id = %worker_id,
                job_id = %job_id,
                current_job = ?entry.current_job,
                "Released session was bound to a different job"
            );
        }

        if entry.state != SessionState::Busy || session.is_closed() {
            let state = entry.state;
            self.sessions.remove(&worker_id);
            tracing::info!(worker_id = %worker_id, state = ?state, "Session removed after job finished");
            return;
        }

        entry.state = SessionState::Idle;
        entry.current_job = None;
        entry.session = Some(session);
    }

    /// React to a lost connection. Idle sessions are removed now; busy
    /// ones are marked closed and removed when their job is released.
    /// Returns the job that was running on the session, if any.
    pub fn mark_closed(&mut self, worker_id: WorkerId) -> Option<JobId> {
        let entry = self.sessions.get_mut(&worker_id)?;
        let state = entry.state;
        match state {
            SessionState::Idle => {
                self.sessions.remove(&worker_id);
                tracing::info!(worker_id = %worker_id, "Idle session removed after connection loss");
                None
            }
            SessionState::Busy | SessionState::Draining | SessionState::Closed => {
                entry.state = SessionState::Closed;
                entry.current_job
            }
        }
    }

    /// Remove a worker on request. A busy worker finishes its current job
    /// first and takes no new work meanwhile.
    pub fn deregister(&mut self, worker_id: WorkerId) -> Result<()> {
        let entry = self
            .sessions
            .get_mut(&worker_id)
            .ok_or(ProvisionerError::WorkerNotFound(worker_id))?;
        let state = entry.state;
        match state {
            SessionState::Idle => {
                if let Some(session) = self.sessions.remove(&worker_id).and_then(|e| e.session) {
                    session.close();
                }
                tracing::info!(worker_id = %worker_id, "Worker deregistered");
            }
            SessionState::Busy => {
                entry.state = SessionState::Draining;
                tracing::info!(
                    worker_id = %worker_id,
                    job_id = ?entry.current_job,
                    "Worker draining, will be removed after its current job"
                );
            }
            SessionState::Draining | SessionState::Closed => {}
        }
        Ok(())
    }

    pub fn get(&self, worker_id: &WorkerId) -> Option<&SessionEntry> {
        self.sessions.get(worker_id)
    }

    /// All sessions, oldest connection first.
    pub fn workers(&self) -> Vec<WorkerSnapshot> {
        let mut workers: Vec<WorkerSnapshot> =
            self.sessions.values().map(SessionEntry::snapshot).collect();
        workers.sort_by_key(|w| w.connected_at);
        workers
    }

    pub fn idle_count(&self) -> usize {
        self.sessions.values().filter(|e| e.is_available()).count()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
