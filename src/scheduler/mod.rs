pub mod assigner;
pub mod dispatcher;
pub mod events;
pub mod job;
pub mod queue;

pub use assigner::{tags_satisfy, JobAssigner, SessionState, WorkerSnapshot};
pub use dispatcher::{Dispatcher, SchedulerState, SubmitJob};
pub use events::{EventLog, EventSource, LogEvent, LogLevel};
pub use job::{
    ArchiveRef, FailureKind, Job, JobError, JobId, JobInput, JobKind, JobResult, JobSnapshot,
    JobStatus, ParameterSchema, ParameterValue, Resource, WorkerId,
};
pub use queue::JobQueue;
