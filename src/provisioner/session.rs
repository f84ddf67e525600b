use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::DispatchConfig;
use crate::proto::{
    parse_response, provision_response, worker_message, Config, Log, ParseRequest, ParseResponse,
    ProvisionResponse, ServerMessage, WorkerMessage,
};
use crate::protocol::ServerChannel;
use crate::provisioner::connection::spawn_read_loop;
use crate::scheduler::events::{EventLog, EventSource};
use crate::scheduler::job::{
    JobError, JobId, JobKind, JobResult, ParameterSchema, ParameterValue, Resource, WorkerId,
};

#[derive(Debug, Clone, Copy)]
pub struct SessionTimeouts {
    pub cancel_grace_period: Duration,
    pub max_exchange_duration: Duration,
}

impl From<&DispatchConfig> for SessionTimeouts {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            cancel_grace_period: config.cancel_grace_period,
            max_exchange_duration: config.max_exchange_duration,
        }
    }
}

/// Everything a session needs to execute one job, copied out of the job at
/// assignment time. The event log and cancel token are shared with the job.
#[derive(Debug, Clone)]
pub struct JobExecution {
    pub job_id: JobId,
    pub kind: JobKind,
    pub archive_hash: String,
    pub parameters: Vec<ParameterValue>,
    pub events: Arc<EventLog>,
    pub cancel: CancellationToken,
}

/// How a single Parse or Provision exchange ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ExchangeOutcome<T> {
    Completed(T),
    Canceled,
    Failed(JobError),
}

/// How a whole job ended on this session.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Succeeded(JobResult),
    Canceled,
    Failed(JobError),
}

impl From<ExchangeOutcome<Vec<Resource>>> for JobOutcome {
    fn from(outcome: ExchangeOutcome<Vec<Resource>>) -> Self {
        match outcome {
            ExchangeOutcome::Completed(resources) => {
                JobOutcome::Succeeded(JobResult::WorkspaceBuild { resources })
            }
            ExchangeOutcome::Canceled => JobOutcome::Canceled,
            ExchangeOutcome::Failed(e) => JobOutcome::Failed(e),
        }
    }
}

/// The control plane's live binding to one connected worker.
///
/// A session runs at most one exchange at a time; `&mut self` on the
/// exchange methods enforces that.
#[derive(Debug)]
pub struct ProvisionerSession {
    worker_id: WorkerId,
    outbound: mpsc::Sender<ServerMessage>,
    inbound: mpsc::Receiver<WorkerMessage>,
    connection: CancellationToken,
    timeouts: SessionTimeouts,
}

impl ProvisionerSession {
    /// Take ownership of a connected channel and start its read loop.
    /// `closed_tx` receives `worker_id` when the connection goes away.
    pub fn connect(
        worker_id: WorkerId,
        channel: ServerChannel,
        closed_tx: mpsc::UnboundedSender<WorkerId>,
        timeouts: SessionTimeouts,
    ) -> Self {
        let handle = spawn_read_loop(worker_id, channel, closed_tx);
        Self {
            worker_id,
            outbound: handle.outbound,
            inbound: handle.inbound,
            connection: handle.shutdown,
            timeouts,
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn is_closed(&self) -> bool {
        self.connection.is_cancelled() || self.outbound.is_closed()
    }

    /// Close the underlying connection.
    pub fn close(&self) {
        self.connection.cancel();
    }

    /// Drive `exec` to an outcome.
    ///
    /// A template import parses and then plans with a dry-run provision; a
    /// workspace build provisions for real.
    pub async fn run(&mut self, exec: &JobExecution) -> JobOutcome {
        match exec.kind {
            JobKind::WorkspaceBuild => self.run_provision(exec, false).await.into(),
            JobKind::TemplateImport => {
                let parameter_schemas = match self.run_parse(exec).await {
                    ExchangeOutcome::Completed(schemas) => schemas,
                    ExchangeOutcome::Canceled => return JobOutcome::Canceled,
                    ExchangeOutcome::Failed(e) => return JobOutcome::Failed(e),
                };
                if exec.cancel.is_cancelled() {
                    return JobOutcome::Canceled;
                }
                match self.run_provision(exec, true).await {
                    ExchangeOutcome::Completed(resources) => {
                        JobOutcome::Succeeded(JobResult::TemplateImport {
                            parameter_schemas,
                            resources,
                        })
                    }
                    ExchangeOutcome::Canceled => JobOutcome::Canceled,
                    ExchangeOutcome::Failed(e) => JobOutcome::Failed(e),
                }
            }
        }
    }

    /// Run the Parse exchange.
    ///
    /// Parse is request/response-stream only, so a cancellation request
    /// cannot be forwarded. The session keeps consuming the stream for at
    /// most the grace period and reports `Canceled` if parsing finishes in
    /// time; the parse result is discarded.
    pub async fn run_parse(&mut self, exec: &JobExecution) -> ExchangeOutcome<Vec<ParameterSchema>> {
        self.drain_stale();

        let request = ServerMessage::parse(ParseRequest {
            archive_hash: exec.archive_hash.clone(),
        });
        if self.outbound.send(request).await.is_err() {
            return ExchangeOutcome::Failed(JobError::connection_lost());
        }
        tracing::debug!(job_id = %exec.job_id, worker_id = %self.worker_id, "Parse started");

        let deadline = Instant::now() + self.timeouts.max_exchange_duration;
        let mut grace_deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = exec.cancel.cancelled(), if grace_deadline.is_none() => {
                    grace_deadline = Some(Instant::now() + self.timeouts.cancel_grace_period);
                    tracing::info!(
                        job_id = %exec.job_id,
                        worker_id = %self.worker_id,
                        "Cancellation requested during parse, waiting for it to finish"
                    );
                }
                _ = sleep_until_opt(grace_deadline) => {
                    return self.abandon(exec, JobError::cancellation_timeout(self.timeouts.cancel_grace_period));
                }
                _ = sleep_until(deadline) => {
                    return self.abandon(exec, JobError::timeout(self.timeouts.max_exchange_duration));
                }
                message = self.inbound.recv() => {
                    let Some(message) = message else {
                        return ExchangeOutcome::Failed(JobError::connection_lost());
                    };
                    let event = match message.message {
                        Some(worker_message::Message::Parse(ParseResponse { event: Some(event) })) => event,
                        _ => {
                            tracing::warn!(job_id = %exec.job_id, worker_id = %self.worker_id, "Ignoring unexpected message during parse");
                            continue;
                        }
                    };
                    match event {
                        parse_response::Event::Log(log) => {
                            if !record(exec, EventSource::Parse, log, deadline).await {
                                return self.abandon(exec, JobError::timeout(self.timeouts.max_exchange_duration));
                            }
                        }
                        parse_response::Event::Complete(complete) => {
                            if grace_deadline.is_some() {
                                return ExchangeOutcome::Canceled;
                            }
                            let schemas = complete
                                .parameter_schemas
                                .into_iter()
                                .map(ParameterSchema::from)
                                .collect();
                            return ExchangeOutcome::Completed(schemas);
                        }
                        parse_response::Event::Error(error) => {
                            return ExchangeOutcome::Failed(JobError::worker(error.message));
                        }
                    }
                }
            }
        }
    }

    /// Run the Provision exchange.
    ///
    /// Cancellation is forwarded as a single `Cancel` directive. A
    /// `Complete` that arrives after it still counts as success: the
    /// provisioner finished before it observed the request.
    pub async fn run_provision(
        &mut self,
        exec: &JobExecution,
        dry_run: bool,
    ) -> ExchangeOutcome<Vec<Resource>> {
        self.drain_stale();

        let config = Config {
            archive_hash: exec.archive_hash.clone(),
            parameters: exec.parameters.iter().cloned().map(Into::into).collect(),
            dry_run,
        };
        if self
            .outbound
            .send(ServerMessage::provision_config(config))
            .await
            .is_err()
        {
            return ExchangeOutcome::Failed(JobError::connection_lost());
        }
        tracing::debug!(job_id = %exec.job_id, worker_id = %self.worker_id, dry_run, "Provision started");

        let deadline = Instant::now() + self.timeouts.max_exchange_duration;
        let mut grace_deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = exec.cancel.cancelled(), if grace_deadline.is_none() => {
                    if self.outbound.send(ServerMessage::provision_cancel()).await.is_err() {
                        return ExchangeOutcome::Failed(JobError::connection_lost());
                    }
                    grace_deadline = Some(Instant::now() + self.timeouts.cancel_grace_period);
                    tracing::info!(job_id = %exec.job_id, worker_id = %self.worker_id, "Forwarded cancellation to provisioner");
                }
                _ = sleep_until_opt(grace_deadline) => {
                    return self.abandon(exec, JobError::cancellation_timeout(self.timeouts.cancel_grace_period));
                }
                _ = sleep_until(deadline) => {
                    return self.abandon(exec, JobError::timeout(self.timeouts.max_exchange_duration));
                }
                message = self.inbound.recv() => {
                    let Some(message) = message else {
                        return ExchangeOutcome::Failed(JobError::connection_lost());
                    };
                    let event = match message.message {
                        Some(worker_message::Message::Provision(ProvisionResponse { event: Some(event) })) => event,
                        _ => {
                            tracing::warn!(job_id = %exec.job_id, worker_id = %self.worker_id, "Ignoring unexpected message during provision");
                            continue;
                        }
                    };
                    match event {
                        provision_response::Event::Log(log) => {
                            if !record(exec, EventSource::Provision, log, deadline).await {
                                return self.abandon(exec, JobError::timeout(self.timeouts.max_exchange_duration));
                            }
                        }
                        provision_response::Event::Complete(complete) => {
                            let resources = complete.resources.into_iter().map(Resource::from).collect();
                            return ExchangeOutcome::Completed(resources);
                        }
                        provision_response::Event::Error(error) => {
                            return ExchangeOutcome::Failed(JobError::worker(error.message));
                        }
                        provision_response::Event::Canceled(_) => {
                            return ExchangeOutcome::Canceled;
                        }
                    }
                }
            }
        }
    }

    /// Give up on an unresponsive worker: close its connection and fail.
    fn abandon<T>(&self, exec: &JobExecution, error: JobError) -> ExchangeOutcome<T> {
        tracing::warn!(
            job_id = %exec.job_id,
            worker_id = %self.worker_id,
            error = %error,
            "Abandoning exchange and closing worker connection"
        );
        self.close();
        ExchangeOutcome::Failed(error)
    }

    /// Discard messages left over from an earlier exchange.
    fn drain_stale(&mut self) {
        let mut stale = 0usize;
        while self.inbound.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            tracing::warn!(worker_id = %self.worker_id, stale, "Discarded messages received outside an exchange");
        }
    }
}

impl Drop for ProvisionerSession {
    fn drop(&mut self) {
        self.connection.cancel();
    }
}

/// Append a worker log line. Returns false if a blocked append was still
/// waiting for room at `deadline`.
async fn record(exec: &JobExecution, source: EventSource, log: Log, deadline: Instant) -> bool {
    tokio::select! {
        _ = exec.events.append_proto(source, log) => true,
        _ = sleep_until(deadline) => false,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
