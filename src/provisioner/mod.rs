//! Control-plane side of a worker connection.
//!
//! - [`connection`]: the single read loop that owns a connection's
//!   [`MessageChannel`](crate::protocol::MessageChannel)
//! - [`session`]: [`ProvisionerSession`], which drives one job at a time
//!   through the Parse and Provision exchanges

pub mod connection;
pub mod session;

pub use session::{ExchangeOutcome, JobExecution, JobOutcome, ProvisionerSession, SessionTimeouts};
