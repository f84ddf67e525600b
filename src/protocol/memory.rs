use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::protocol::channel::{ChannelError, MessageChannel};

/// One end of an in-process channel pair.
pub struct MemoryChannel<S, R> {
    tx: Option<mpsc::Sender<S>>,
    rx: mpsc::Receiver<R>,
}

/// Create two connected ends. Messages sent on one are received on the
/// other, in order. `buffer` bounds each direction.
pub fn pair<A, B>(buffer: usize) -> (MemoryChannel<A, B>, MemoryChannel<B, A>) {
    let (a_tx, a_rx) = mpsc::channel(buffer);
    let (b_tx, b_rx) = mpsc::channel(buffer);
    (
        MemoryChannel {
            tx: Some(a_tx),
            rx: b_rx,
        },
        MemoryChannel {
            tx: Some(b_tx),
            rx: a_rx,
        },
    )
}

#[async_trait]
impl<S, R> MessageChannel<S, R> for MemoryChannel<S, R>
where
    S: Send + 'static,
    R: Send + 'static,
{
    async fn send(&mut self, message: S) -> Result<(), ChannelError> {
        let tx = self.tx.as_ref().ok_or(ChannelError::Closed)?;
        tx.send(message).await.map_err(|_| ChannelError::Closed)
    }

    async fn recv(&mut self) -> Result<Option<R>, ChannelError> {
        Ok(self.rx.recv().await)
    }

    async fn close(&mut self) {
        self.tx = None;
        self.rx.close();
    }
}
