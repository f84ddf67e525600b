//! Transport-independent message channels for worker connections.
//!
//! A [`MessageChannel`] moves whole protocol messages in both directions
//! and knows nothing about Parse or Provision semantics. Two
//! implementations exist:
//!
//! - [`FramedChannel`]: length-delimited protobuf frames over any async
//!   byte stream (TCP in production)
//! - [`MemoryChannel`]: an in-process pair backed by tokio channels

pub mod channel;
pub mod framed;
pub mod memory;

pub use channel::{ChannelError, MessageChannel, ServerChannel, WorkerChannel};
pub use framed::FramedChannel;
pub use memory::MemoryChannel;
