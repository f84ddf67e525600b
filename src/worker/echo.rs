use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::proto::{
    Config, Log, LogLevel, ParameterSchema, ParseComplete, ParseRequest, ProvisionComplete,
    Resource,
};
use crate::worker::runtime::{LogSink, ProvisionResult, Provisioner};

/// Parameter that makes the echo provisioner fail with its value as the
/// error message.
pub const FAIL_PARAMETER: &str = "echo_fail";

/// A provisioner that touches nothing.
///
/// Parse reports the configured parameter schemas. Provision logs every
/// parameter, pausing `step_delay` before each, and reports one resource
/// per parameter. Useful for demos and for exercising the control plane.
#[derive(Debug, Clone)]
pub struct EchoProvisioner {
    step_delay: Duration,
    parameter_schemas: Vec<ParameterSchema>,
}

impl EchoProvisioner {
    pub fn new(step_delay: Duration) -> Self {
        Self {
            step_delay,
            parameter_schemas: Vec::new(),
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, default_value: Option<&str>) -> Self {
        let name = name.into();
        self.parameter_schemas.push(ParameterSchema {
            description: format!("Echoed as {}", name),
            required: default_value.is_none(),
            default_value: default_value.map(str::to_string),
            name,
        });
        self
    }

    /// Sleep one step. Returns false if canceled first.
    async fn step(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.step_delay) => true,
            _ = cancel.cancelled() => false,
        }
    }
}

#[async_trait]
impl Provisioner for EchoProvisioner {
    async fn parse(&self, request: ParseRequest, logs: LogSink) -> Result<ParseComplete, String> {
        logs.info(format!("parsing template {}", request.archive_hash)).await;
        tokio::time::sleep(self.step_delay).await;
        for schema in &self.parameter_schemas {
            logs.info(format!("found parameter {}", schema.name)).await;
        }
        Ok(ParseComplete {
            parameter_schemas: self.parameter_schemas.clone(),
        })
    }

    async fn provision(
        &self,
        config: Config,
        logs: LogSink,
        cancel: CancellationToken,
    ) -> ProvisionResult {
        let mode = if config.dry_run { "planning" } else { "applying" };
        logs.info(format!("{} template {}", mode, config.archive_hash)).await;

        let mut resources = Vec::with_capacity(config.parameters.len());
        for param in &config.parameters {
            if !self.step(&cancel).await {
                logs.warn("canceled").await;
                return ProvisionResult::Canceled;
            }
            if param.name == FAIL_PARAMETER {
                logs.error(format!("failing on request: {}", param.value)).await;
                return ProvisionResult::Error(param.value.clone());
            }
            logs.send(
                Log::new(LogLevel::Info, format!("{}={}", param.name, param.value))
                    .with_field("parameter", param.name.clone()),
            )
            .await;
            resources.push(Resource {
                name: param.name.clone(),
                resource_type: "echo_parameter".to_string(),
                // Planned resources have no instance yet
                instance_id: if config.dry_run {
                    Vec::new()
                } else {
                    Uuid::new_v4().as_bytes().to_vec()
                },
            });
        }

        if config.parameters.is_empty() && !self.step(&cancel).await {
            logs.warn("canceled").await;
            return ProvisionResult::Canceled;
        }

        logs.info(format!("done, {} resources", resources.len())).await;
        ProvisionResult::Complete(ProvisionComplete { resources })
    }
}
