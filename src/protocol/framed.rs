use std::marker::PhantomData;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use prost::Message;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::protocol::channel::{ChannelError, MessageChannel};

/// Largest frame accepted in either direction.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Protobuf messages framed with a 4-byte big-endian length prefix.
pub struct FramedChannel<S, R, T> {
    framed: Framed<T, LengthDelimitedCodec>,
    _messages: PhantomData<fn(S) -> R>,
}

impl<S, R, T> FramedChannel<S, R, T>
where
    T: AsyncRead + AsyncWrite,
{
    pub fn new(io: T) -> Self {
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(MAX_FRAME_BYTES)
            .new_codec();
        Self {
            framed: Framed::new(io, codec),
            _messages: PhantomData,
        }
    }
}

#[async_trait]
impl<S, R, T> MessageChannel<S, R> for FramedChannel<S, R, T>
where
    S: Message + Send + 'static,
    R: Message + Default + Send + 'static,
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, message: S) -> Result<(), ChannelError> {
        self.framed
            .send(Bytes::from(message.encode_to_vec()))
            .await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<R>, ChannelError> {
        match self.framed.next().await {
            None => Ok(None),
            Some(frame) => Ok(Some(R::decode(frame?)?)),
        }
    }

    async fn close(&mut self) {
        if let Err(e) = SinkExt::<Bytes>::close(&mut self.framed).await {
            tracing::debug!(error = %e, "Error while closing framed channel");
        }
    }
}
