use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::EventBufferConfig;
use crate::error::{ProvisionerError, Result};
use crate::proto;
use crate::scheduler::events::{EventLog, LogEvent};

pub type JobId = Uuid;
pub type WorkerId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Parse a template and plan it with a dry-run provision.
    TemplateImport,
    /// Provision a workspace from a template.
    WorkspaceBuild,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKind::TemplateImport => write!(f, "template_import"),
            JobKind::WorkspaceBuild => write!(f, "workspace_build"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Canceling,
    Succeeded,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled
        )
    }

    /// Whether a worker is bound to a job in this status.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Running | JobStatus::Canceling)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Canceled)
                | (Running, Canceling)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Canceled)
                | (Canceling, Canceled)
                | (Canceling, Succeeded)
                | (Canceling, Failed)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Canceling => write!(f, "canceling"),
            JobStatus::Succeeded => write!(f, "succeeded"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Canceled => write!(f, "canceled"),
        }
    }
}

/// Content-addressed reference to an uploaded template archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveRef {
    pub hash: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterValue {
    pub name: String,
    pub value: String,
}

impl ParameterValue {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl From<ParameterValue> for proto::ParameterValue {
    fn from(p: ParameterValue) -> Self {
        Self {
            name: p.name,
            value: p.value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInput {
    pub archive: ArchiveRef,
    /// Ordered as submitted.
    pub parameters: Vec<ParameterValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The worker reported `Error`.
    WorkerError,
    /// The connection dropped before a terminal event arrived.
    ConnectionLost,
    /// The worker did not honor `Cancel` within the grace period.
    CancellationTimeout,
    /// The exchange exceeded its maximum duration.
    Timeout,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::WorkerError => write!(f, "worker_error"),
            FailureKind::ConnectionLost => write!(f, "connection_lost"),
            FailureKind::CancellationTimeout => write!(f, "cancellation_timeout"),
            FailureKind::Timeout => write!(f, "timeout"),
        }
    }
}

/// Terminal error of a failed job. `message` is shown to users verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: FailureKind,
    pub message: String,
}

impl JobError {
    pub fn worker(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::WorkerError,
            message: message.into(),
        }
    }

    pub fn connection_lost() -> Self {
        Self {
            kind: FailureKind::ConnectionLost,
            message: "connection to provisioner lost before the job finished".to_string(),
        }
    }

    pub fn cancellation_timeout(grace: std::time::Duration) -> Self {
        Self {
            kind: FailureKind::CancellationTimeout,
            message: format!(
                "provisioner did not acknowledge cancellation within {}ms",
                grace.as_millis()
            ),
        }
    }

    pub fn timeout(limit: std::time::Duration) -> Self {
        Self {
            kind: FailureKind::Timeout,
            message: format!("exchange exceeded maximum duration of {}s", limit.as_secs()),
        }
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSchema {
    pub name: String,
    pub description: String,
    pub default_value: Option<String>,
    pub required: bool,
}

impl From<proto::ParameterSchema> for ParameterSchema {
    fn from(p: proto::ParameterSchema) -> Self {
        Self {
            name: p.name,
            description: p.description,
            default_value: p.default_value,
            required: p.required,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    pub resource_type: String,
    #[serde(with = "hex::serde")]
    pub instance_id: Vec<u8>,
}

impl From<proto::Resource> for Resource {
    fn from(r: proto::Resource) -> Self {
        Self {
            name: r.name,
            resource_type: r.resource_type,
            instance_id: r.instance_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobResult {
    TemplateImport {
        parameter_schemas: Vec<ParameterSchema>,
        /// Resources the template would create (dry-run plan).
        resources: Vec<Resource>,
    },
    WorkspaceBuild {
        resources: Vec<Resource>,
    },
}

/// Authoritative record of one job. Owned by the [`JobQueue`]; outside the
/// dispatcher it is only ever seen as a [`JobSnapshot`].
///
/// [`JobQueue`]: crate::scheduler::JobQueue
#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub input: JobInput,
    pub required_tags: BTreeSet<String>,
    pub status: JobStatus,
    pub assigned_worker: Option<WorkerId>,
    pub events: Arc<EventLog>,
    pub result: Option<JobResult>,
    pub error: Option<JobError>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    /// Set once a requester has read the terminal result.
    pub result_read: bool,
    cancel: CancellationToken,
}

impl Job {
    pub fn new(
        kind: JobKind,
        input: JobInput,
        required_tags: BTreeSet<String>,
        events: &EventBufferConfig,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            input,
            required_tags,
            status: JobStatus::Pending,
            assigned_worker: None,
            events: Arc::new(EventLog::new(events)),
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            canceled_at: None,
            result_read: false,
            cancel: CancellationToken::new(),
        }
    }

    /// Token fired when cancellation is requested for this job.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn transition(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(ProvisionerError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.assigned_worker = None;
            self.completed_at = Some(Utc::now());
            self.events.close();
        }
        Ok(())
    }

    /// pending -> running, bound to `worker_id`.
    pub fn start(&mut self, worker_id: WorkerId) -> Result<()> {
        self.transition(JobStatus::Running)?;
        self.assigned_worker = Some(worker_id);
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Record a cancellation request. Pending jobs are canceled outright;
    /// running jobs move to canceling and their session is signalled.
    /// Returns false when there was nothing to do.
    pub fn request_cancel(&mut self) -> Result<bool> {
        match self.status {
            JobStatus::Pending => {
                self.canceled_at = Some(Utc::now());
                self.transition(JobStatus::Canceled)?;
            }
            JobStatus::Running => {
                self.canceled_at = Some(Utc::now());
                self.transition(JobStatus::Canceling)?;
            }
            _ => return Ok(false),
        }
        self.cancel.cancel();
        Ok(true)
    }

    pub fn succeed(&mut self, result: JobResult) -> Result<()> {
        self.transition(JobStatus::Succeeded)?;
        self.result = Some(result);
        Ok(())
    }

    pub fn fail(&mut self, error: JobError) -> Result<()> {
        self.transition(JobStatus::Failed)?;
        self.error = Some(error);
        Ok(())
    }

    pub fn mark_canceled(&mut self) -> Result<()> {
        if self.canceled_at.is_none() {
            self.canceled_at = Some(Utc::now());
        }
        self.transition(JobStatus::Canceled)
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            kind: self.kind,
            status: self.status,
            input: self.input.clone(),
            required_tags: self.required_tags.clone(),
            assigned_worker: self.assigned_worker,
            result: self.result.clone(),
            error: self.error.clone(),
            events: self.events.snapshot(),
            last_sequence: self.events.last_sequence(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            canceled_at: self.canceled_at,
        }
    }
}

/// Point-in-time copy of a job handed to collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub input: JobInput,
    pub required_tags: BTreeSet<String>,
    pub assigned_worker: Option<WorkerId>,
    pub result: Option<JobResult>,
    pub error: Option<JobError>,
    /// Events still retained in memory.
    pub events: Vec<LogEvent>,
    pub last_sequence: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
}
