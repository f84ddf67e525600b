use thiserror::Error;
use uuid::Uuid;

use crate::protocol::ChannelError;
use crate::scheduler::JobStatus;

#[derive(Error, Debug)]
pub enum ProvisionerError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Worker not found: {0}")]
    WorkerNotFound(Uuid),

    #[error("Template archive is {size} bytes, exceeding the {limit} byte limit")]
    ArchiveTooLarge { size: u64, limit: u64 },

    #[error("Job queue is at capacity")]
    QueueFull,

    #[error("Invalid job transition from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProvisionerError>;
