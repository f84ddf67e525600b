use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Cancel `token` on the first SIGTERM or SIGINT.
///
/// The control plane stops accepting workers and asks running jobs to
/// cancel; a worker stops serving. Fails if the signal handlers cannot be
/// installed.
pub fn install_shutdown_handler(token: CancellationToken) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        let signal_name = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
            // Cancelled elsewhere; nothing left to listen for
            _ = token.cancelled() => return,
        };
        tracing::info!(signal = signal_name, "Shutdown signal received");
        token.cancel();
    });

    Ok(())
}
