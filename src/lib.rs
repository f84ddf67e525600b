pub mod api;
pub mod config;
pub mod error;
pub mod node;
pub mod proto;
pub mod protocol;
pub mod provisioner;
pub mod scheduler;
pub mod server;
pub mod shutdown;
pub mod worker;

pub use error::{ProvisionerError, Result};
