use async_trait::async_trait;
use thiserror::Error;

use crate::proto::{ServerMessage, WorkerMessage};

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,

    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to decode message: {0}")]
    Decode(#[from] prost::DecodeError),
}

/// A bidirectional, ordered message channel: sends `S`, receives `R`.
#[async_trait]
pub trait MessageChannel<S, R>: Send
where
    S: Send + 'static,
    R: Send + 'static,
{
    async fn send(&mut self, message: S) -> Result<(), ChannelError>;

    /// Next message from the peer, `Ok(None)` once the peer has closed.
    ///
    /// Must be cancel-safe: dropping the future before it resolves loses
    /// no message. Connection read loops rely on this inside `select!`.
    async fn recv(&mut self) -> Result<Option<R>, ChannelError>;

    async fn close(&mut self);
}

/// The control plane's end of a worker connection.
pub type ServerChannel = Box<dyn MessageChannel<ServerMessage, WorkerMessage>>;

/// The worker's end of a connection to the control plane.
pub type WorkerChannel = Box<dyn MessageChannel<WorkerMessage, ServerMessage>>;
