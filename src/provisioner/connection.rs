use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::proto::{ServerMessage, WorkerMessage};
use crate::protocol::ServerChannel;
use crate::scheduler::job::WorkerId;

const OUTBOUND_CAPACITY: usize = 16;
const INBOUND_CAPACITY: usize = 64;
/// Bound on flushing a connection whose peer stopped reading.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Channels into and out of a connection's read loop.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub outbound: mpsc::Sender<ServerMessage>,
    pub inbound: mpsc::Receiver<WorkerMessage>,
    pub shutdown: CancellationToken,
}

/// Spawn the read loop for one worker connection.
///
/// The loop is the only owner of the channel. It writes whatever the
/// session queues on `outbound`, forwards everything the worker sends to
/// `inbound`, and keeps reading while the session is idle so a dead
/// connection is noticed without an exchange in flight. When it stops for
/// any reason it drops `inbound` (so a running exchange sees the loss) and
/// reports `worker_id` on `closed_tx`.
pub fn spawn_read_loop(
    worker_id: WorkerId,
    mut channel: ServerChannel,
    closed_tx: mpsc::UnboundedSender<WorkerId>,
) -> ConnectionHandle {
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_CAPACITY);
    let (in_tx, in_rx) = mpsc::channel::<WorkerMessage>(INBOUND_CAPACITY);
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();

    tokio::spawn(async move {
        let reason = loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => break "closed by control plane",

                outbound = out_rx.recv() => match outbound {
                    Some(message) => {
                        // A worker that stops reading must not pin the loop
                        tokio::select! {
                            sent = channel.send(message) => {
                                if let Err(e) = sent {
                                    tracing::warn!(worker_id = %worker_id, error = %e, "Failed to send to worker");
                                    break "send failed";
                                }
                            }
                            _ = token.cancelled() => break "closed by control plane",
                        }
                    }
                    None => break "session dropped",
                },

                inbound = channel.recv() => match inbound {
                    Ok(Some(message)) => {
                        // Waiting here is the backpressure path when the
                        // session is slow to apply events.
                        tokio::select! {
                            sent = in_tx.send(message) => {
                                if sent.is_err() {
                                    break "session dropped";
                                }
                            }
                            _ = token.cancelled() => break "closed by control plane",
                        }
                    }
                    Ok(None) => break "worker closed connection",
                    Err(e) => {
                        tracing::warn!(worker_id = %worker_id, error = %e, "Failed to read from worker");
                        break "receive failed";
                    }
                },
            }
        };

        if tokio::time::timeout(CLOSE_TIMEOUT, channel.close()).await.is_err() {
            tracing::debug!(worker_id = %worker_id, "Gave up flushing worker connection");
        }
        drop(channel);
        drop(in_tx);
        tracing::info!(worker_id = %worker_id, reason, "Worker connection closed");
        // The dispatcher may already be gone during shutdown
        let _ = closed_tx.send(worker_id);
    });

    ConnectionHandle {
        outbound: out_tx,
        inbound: in_rx,
        shutdown,
    }
}
