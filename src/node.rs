use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::api::{run_api, run_archive_gc, ApiState};
use crate::config::NodeConfig;
use crate::error::Result;
use crate::scheduler::Dispatcher;
use crate::server::WorkerListener;

/// The control plane: dispatcher, worker listener and HTTP API.
pub struct Node {
    pub config: NodeConfig,
    pub dispatcher: Arc<Dispatcher>,
    listener: WorkerListener,
}

impl Node {
    /// Bind the worker listener. The API binds when the node runs.
    pub async fn new(config: NodeConfig) -> Result<Self> {
        let dispatcher = Dispatcher::new(config.dispatch.clone());
        let listener =
            WorkerListener::bind(config.worker_addr, dispatcher.clone(), config.hello_timeout)
                .await?;
        Ok(Self {
            config,
            dispatcher,
            listener,
        })
    }

    pub fn worker_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the node until `shutdown` fires.
    ///
    /// 1. Spawns the dispatcher loop (session closures, assignment, GC)
    /// 2. Spawns the HTTP control API and its archive sweep
    /// 3. Runs the worker listener (blocking)
    ///
    /// # Errors
    ///
    /// Returns an error if the worker listener fails. The API runs as a
    /// spawned task and logs its own errors.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let dispatcher = self.dispatcher.clone();
        let dispatcher_shutdown = shutdown.clone();
        let dispatcher_task = tokio::spawn(async move {
            dispatcher.run(dispatcher_shutdown).await;
        });

        let api_state = ApiState::new(self.dispatcher.clone());
        tokio::spawn(run_archive_gc(api_state.clone(), shutdown.clone()));
        let api_addr = self.config.api_addr;
        let api_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = run_api(api_addr, api_state, api_shutdown).await {
                tracing::error!(addr = %api_addr, error = %e, "Control API failed");
            }
        });

        let result = self.listener.run(shutdown).await;
        if let Err(e) = dispatcher_task.await {
            tracing::warn!(error = %e, "Dispatcher task ended abnormally");
        }
        result
    }
}
