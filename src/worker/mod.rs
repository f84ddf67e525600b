//! Worker side of the provisioner protocol.
//!
//! A worker dials the control plane, introduces itself with a `Hello`
//! carrying its name and capability tags, then answers Parse and Provision
//! exchanges one at a time for as long as the connection stays up.
//!
//! # Components
//!
//! - [`Provisioner`]: the backend trait a worker delegates template work to
//! - [`serve`]: drives exchanges on an established channel
//! - [`EchoProvisioner`]: logs parameters back, creates nothing
//! - [`CommandProvisioner`]: runs shell commands and streams their output
//!
//! # Cancellation
//!
//! A `Cancel` from the control plane fires the token handed to
//! [`Provisioner::provision`]. The backend decides how quickly to stop;
//! the control plane gives up after its grace period.

pub mod echo;
pub mod executor;
pub mod runtime;

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::config::{ProvisionerBackend, WorkerConfig};
use crate::error::Result;
use crate::proto::WorkerMessage;
use crate::protocol::{FramedChannel, WorkerChannel};

pub use echo::EchoProvisioner;
pub use executor::CommandProvisioner;
pub use runtime::{serve, LogSink, ProvisionResult, Provisioner};

/// Build the provisioner selected in `config`.
pub fn build_provisioner(config: &WorkerConfig) -> Arc<dyn Provisioner> {
    match &config.backend {
        ProvisionerBackend::Echo { step_delay } => Arc::new(EchoProvisioner::new(*step_delay)),
        ProvisionerBackend::Command(command) => Arc::new(CommandProvisioner::new(command.clone())),
    }
}

/// Connect to the control plane, register, and serve until the
/// connection closes.
pub async fn connect_and_serve(
    config: &WorkerConfig,
    provisioner: Arc<dyn Provisioner>,
) -> Result<()> {
    let stream = TcpStream::connect(&config.control_plane_addr).await?;
    stream.set_nodelay(true)?;
    let mut channel: WorkerChannel = Box::new(FramedChannel::new(stream));

    channel
        .send(WorkerMessage::hello(config.name.clone(), config.tags.clone()))
        .await?;
    tracing::info!(
        addr = %config.control_plane_addr,
        name = %config.name,
        tags = ?config.tags,
        "Connected to control plane"
    );

    serve(provisioner, channel).await?;
    Ok(())
}

/// Run a worker until shutdown or until the control plane goes away.
pub async fn run_worker(config: WorkerConfig, shutdown: CancellationToken) -> Result<()> {
    let provisioner = build_provisioner(&config);
    tokio::select! {
        result = connect_and_serve(&config, provisioner) => result,
        _ = shutdown.cancelled() => {
            tracing::info!(name = %config.name, "Worker shutting down");
            Ok(())
        }
    }
}
