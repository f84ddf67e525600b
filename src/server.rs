use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::error::{ProvisionerError, Result};
use crate::proto::{worker_message, Hello, ServerMessage, WorkerMessage};
use crate::protocol::{FramedChannel, ServerChannel};
use crate::scheduler::{Dispatcher, WorkerId};

/// Accepts provisioner worker connections and hands them to the
/// dispatcher.
pub struct WorkerListener {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    hello_timeout: Duration,
}

impl WorkerListener {
    pub async fn bind(
        addr: SocketAddr,
        dispatcher: Arc<Dispatcher>,
        hello_timeout: Duration,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            dispatcher,
            hello_timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` fires. Each connection is
    /// handshaken on its own task so a slow worker cannot hold up others.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(addr = %self.local_addr()?, "Accepting provisioner workers");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Worker listener shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to accept worker connection");
                            continue;
                        }
                    };
                    let dispatcher = self.dispatcher.clone();
                    let hello_timeout = self.hello_timeout;
                    tokio::spawn(async move {
                        if let Err(e) = accept_worker(stream, dispatcher, hello_timeout).await {
                            tracing::warn!(peer = %peer, error = %e, "Rejected worker connection");
                        }
                    });
                }
            }
        }
    }
}

/// Perform the `Hello` handshake on a raw connection and register the
/// worker.
pub async fn accept_worker(
    stream: TcpStream,
    dispatcher: Arc<Dispatcher>,
    hello_timeout: Duration,
) -> Result<WorkerId> {
    stream.set_nodelay(true)?;
    let channel: ServerChannel = Box::new(FramedChannel::<ServerMessage, WorkerMessage, _>::new(stream));
    register_channel(channel, &dispatcher, hello_timeout).await
}

/// Wait for `Hello` on an established channel and register the worker it
/// describes. Any other first message rejects the connection.
pub async fn register_channel(
    mut channel: ServerChannel,
    dispatcher: &Arc<Dispatcher>,
    hello_timeout: Duration,
) -> Result<WorkerId> {
    let first = match tokio::time::timeout(hello_timeout, channel.recv()).await {
        Ok(received) => received?,
        Err(_) => {
            channel.close().await;
            return Err(ProvisionerError::InvalidInput(format!(
                "no hello within {}ms",
                hello_timeout.as_millis()
            )));
        }
    };

    let Hello { name, tags } = match first.and_then(|m| m.message) {
        Some(worker_message::Message::Hello(hello)) => hello,
        _ => {
            channel.close().await;
            return Err(ProvisionerError::InvalidInput(
                "first message must be hello".to_string(),
            ));
        }
    };

    Ok(dispatcher.register_worker(name, tags, channel).await)
}
