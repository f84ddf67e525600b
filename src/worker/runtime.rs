use std::ops::ControlFlow;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::proto::{
    self, parse_response, provision_request, provision_response, server_message, Canceled,
    Config, ExchangeError, LogLevel, ParseComplete, ParseRequest, ProvisionComplete,
    WorkerMessage,
};
use crate::protocol::{ChannelError, WorkerChannel};

/// Log lines buffered between a provisioner and the connection.
const LOG_BUFFER: usize = 64;

/// How a provision run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ProvisionResult {
    Complete(ProvisionComplete),
    /// The run stopped early because cancellation was requested.
    Canceled,
    /// The run failed; the message is shown to users as is.
    Error(String),
}

/// Where a provisioner writes its output while it works.
///
/// Lines are pushed to the control plane as they are produced. Sends wait
/// when the connection is backed up.
#[derive(Debug, Clone)]
pub struct LogSink {
    tx: mpsc::Sender<proto::Log>,
}

impl LogSink {
    pub fn channel() -> (Self, mpsc::Receiver<proto::Log>) {
        let (tx, rx) = mpsc::channel(LOG_BUFFER);
        (Self { tx }, rx)
    }

    pub async fn send(&self, log: proto::Log) {
        // The exchange is over if nobody is listening
        let _ = self.tx.send(log).await;
    }

    pub async fn log(&self, level: LogLevel, output: impl Into<String>) {
        self.send(proto::Log::new(level, output)).await;
    }

    pub async fn info(&self, output: impl Into<String>) {
        self.log(LogLevel::Info, output).await;
    }

    pub async fn warn(&self, output: impl Into<String>) {
        self.log(LogLevel::Warn, output).await;
    }

    pub async fn error(&self, output: impl Into<String>) {
        self.log(LogLevel::Error, output).await;
    }
}

/// A pluggable backend that understands templates.
#[async_trait]
pub trait Provisioner: Send + Sync + 'static {
    /// Inspect a template and report the parameters it accepts.
    async fn parse(&self, request: ParseRequest, logs: LogSink) -> Result<ParseComplete, String>;

    /// Apply (or, with `dry_run`, plan) a template. Implementations should
    /// stop promptly and return [`ProvisionResult::Canceled`] once `cancel`
    /// fires.
    async fn provision(
        &self,
        config: Config,
        logs: LogSink,
        cancel: CancellationToken,
    ) -> ProvisionResult;
}

/// Answer Parse and Provision exchanges on `channel` until the control
/// plane closes it.
pub async fn serve(
    provisioner: Arc<dyn Provisioner>,
    mut channel: WorkerChannel,
) -> Result<(), ChannelError> {
    loop {
        let Some(message) = channel.recv().await? else {
            tracing::info!("Control plane closed the connection");
            return Ok(());
        };

        let flow = match message.message {
            Some(server_message::Message::Parse(request)) => {
                serve_parse(provisioner.as_ref(), request, &mut channel).await?
            }
            Some(server_message::Message::Provision(request)) => match request.directive {
                Some(provision_request::Directive::Config(config)) => {
                    serve_provision(provisioner.as_ref(), config, &mut channel).await?
                }
                Some(provision_request::Directive::Cancel(_)) => {
                    tracing::debug!("Ignoring cancel with no provision running");
                    ControlFlow::Continue(())
                }
                None => {
                    tracing::warn!("Ignoring empty provision request");
                    ControlFlow::Continue(())
                }
            },
            None => {
                tracing::warn!("Ignoring empty message from control plane");
                ControlFlow::Continue(())
            }
        };

        if flow.is_break() {
            return Ok(());
        }
    }
}

async fn serve_parse(
    provisioner: &dyn Provisioner,
    request: ParseRequest,
    channel: &mut WorkerChannel,
) -> Result<ControlFlow<()>, ChannelError> {
    tracing::info!(archive_hash = %request.archive_hash, "Parsing template");
    let (logs, mut log_rx) = LogSink::channel();
    let task = provisioner.parse(request, logs);
    tokio::pin!(task);

    let result = loop {
        tokio::select! {
            result = &mut task => break result,
            Some(log) = log_rx.recv() => {
                channel.send(WorkerMessage::parse(parse_response::Event::Log(log))).await?;
            }
            message = channel.recv() => match message? {
                Some(_) => tracing::warn!("Ignoring message received during parse"),
                None => return Ok(ControlFlow::Break(())),
            },
        }
    };

    // Logs always precede the terminal event
    while let Ok(log) = log_rx.try_recv() {
        channel
            .send(WorkerMessage::parse(parse_response::Event::Log(log)))
            .await?;
    }

    let event = match result {
        Ok(complete) => parse_response::Event::Complete(complete),
        Err(message) => parse_response::Event::Error(ExchangeError { message }),
    };
    channel.send(WorkerMessage::parse(event)).await?;
    Ok(ControlFlow::Continue(()))
}

async fn serve_provision(
    provisioner: &dyn Provisioner,
    config: Config,
    channel: &mut WorkerChannel,
) -> Result<ControlFlow<()>, ChannelError> {
    tracing::info!(archive_hash = %config.archive_hash, dry_run = config.dry_run, "Provisioning");
    let cancel = CancellationToken::new();
    let (logs, mut log_rx) = LogSink::channel();
    let task = provisioner.provision(config, logs, cancel.clone());
    tokio::pin!(task);

    let mut connection_open = true;
    let result = loop {
        tokio::select! {
            result = &mut task => break result,
            Some(log) = log_rx.recv(), if connection_open => {
                channel.send(WorkerMessage::provision(provision_response::Event::Log(log))).await?;
            }
            message = channel.recv(), if connection_open => match message? {
                Some(message) => match message.message {
                    Some(server_message::Message::Provision(proto::ProvisionRequest {
                        directive: Some(provision_request::Directive::Cancel(_)),
                    })) => {
                        if !cancel.is_cancelled() {
                            tracing::info!("Cancellation requested by control plane");
                            cancel.cancel();
                        }
                    }
                    _ => tracing::warn!("Ignoring message received during provision"),
                },
                None => {
                    // Nobody to report to; stop the run and let it clean up
                    tracing::warn!("Control plane went away during provision, canceling");
                    connection_open = false;
                    cancel.cancel();
                    log_rx.close();
                }
            },
        }
    };

    if !connection_open {
        return Ok(ControlFlow::Break(()));
    }

    while let Ok(log) = log_rx.try_recv() {
        channel
            .send(WorkerMessage::provision(provision_response::Event::Log(log)))
            .await?;
    }

    let event = match result {
        ProvisionResult::Complete(complete) => provision_response::Event::Complete(complete),
        ProvisionResult::Canceled => provision_response::Event::Canceled(Canceled {}),
        ProvisionResult::Error(message) => {
            provision_response::Event::Error(ExchangeError { message })
        }
    };
    channel.send(WorkerMessage::provision(event)).await?;
    Ok(ControlFlow::Continue(()))
}
