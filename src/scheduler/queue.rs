use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};

use crate::scheduler::job::{Job, JobId, JobStatus};

const DEFAULT_MAX_JOBS: usize = 10_000;

/// Holds every job the control plane still tracks, plus the pending FIFO.
#[derive(Debug)]
pub struct JobQueue {
    jobs: HashMap<JobId, Job>,
    /// Pending job ids in submission order.
    pending: VecDeque<JobId>,
    max_jobs: usize,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            jobs: HashMap::new(),
            pending: VecDeque::new(),
            max_jobs,
        }
    }

    /// Add a new pending job. Returns false if the queue is at capacity.
    pub fn add_job(&mut self, job: Job) -> bool {
        if self.is_full() {
            return false;
        }
        if job.status == JobStatus::Pending {
            self.pending.push_back(job.id);
        }
        self.jobs.insert(job.id, job);
        true
    }

    pub fn get_job(&self, id: &JobId) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn get_job_mut(&mut self, id: &JobId) -> Option<&mut Job> {
        self.jobs.get_mut(id)
    }

    /// Pending jobs, oldest first.
    pub fn pending_jobs(&self) -> Vec<&Job> {
        self.pending
            .iter()
            .filter_map(|id| self.jobs.get(id))
            .filter(|j| j.status == JobStatus::Pending)
            .collect()
    }

    /// Drop a job from the pending FIFO once it has left `Pending`.
    pub fn remove_pending(&mut self, id: &JobId) {
        self.pending.retain(|p| p != id);
    }

    /// All jobs sorted chronologically by creation time.
    pub fn all_jobs(&self) -> Vec<&Job> {
        let mut jobs: Vec<&Job> = self.jobs.values().collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    /// Jobs a worker is executing or finishing a cancellation for.
    pub fn active_jobs(&self) -> Vec<&Job> {
        self.jobs.values().filter(|j| j.status.is_active()).collect()
    }

    /// Remove terminal jobs whose result has been read and which completed
    /// before `cutoff`. Returns the number of jobs removed.
    pub fn cleanup_finished_jobs(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(|_, job| {
            let expired = job.status.is_terminal()
                && job.result_read
                && job.completed_at.is_some_and(|at| at < cutoff);
            !expired
        });
        before - self.jobs.len()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.jobs.len() >= self.max_jobs
    }
}
