use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::config::CommandProvisionerConfig;
use crate::proto::{
    self, Config, LogLevel, ParameterSchema, ParameterValue, ParseComplete, ParseRequest,
    ProvisionComplete, Resource,
};
use crate::worker::runtime::{LogSink, ProvisionResult, Provisioner};

/// What a finished command run produced.
#[derive(Debug)]
enum RunOutcome {
    Exited {
        success: bool,
        exit_code: Option<i32>,
        stdout: Vec<String>,
        last_stderr: Option<String>,
    },
    Canceled,
}

/// Runs templates through shell commands on the worker host.
///
/// Output is streamed line by line: stdout as info logs, stderr as
/// warnings. Commands report results with directive lines on stdout:
///
/// - `resource <type> <name> [<instance-id>]` during provision
/// - `param <name>[=<default>]` during parse
///
/// A non-zero exit fails the exchange with the last stderr line (or the
/// exit code) as the error message.
#[derive(Debug, Clone)]
pub struct CommandProvisioner {
    config: CommandProvisionerConfig,
}

impl CommandProvisioner {
    pub fn new(config: CommandProvisionerConfig) -> Self {
        Self { config }
    }

    fn command(
        &self,
        script: &str,
        archive_hash: &str,
        parameters: &[ParameterValue],
        dry_run: bool,
    ) -> Command {
        let mut cmd = Command::new(&self.config.shell);
        cmd.arg("-c")
            .arg(script)
            .env("TEMPLATE_ARCHIVE", archive_hash)
            .env("DRY_RUN", if dry_run { "1" } else { "0" })
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for param in parameters {
            cmd.env(env_name(&param.name), &param.value);
        }
        if let Some(ref dir) = self.config.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    async fn run(
        &self,
        mut cmd: Command,
        logs: &LogSink,
        cancel: &CancellationToken,
    ) -> std::io::Result<RunOutcome> {
        let mut child = cmd.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("child stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("child stderr not captured"))?;

        let out_lines = LinesStream::new(BufReader::new(stdout).lines())
            .map(|line| line.map(|l| (LogLevel::Info, l)));
        let err_lines = LinesStream::new(BufReader::new(stderr).lines())
            .map(|line| line.map(|l| (LogLevel::Warn, l)));
        let mut lines = out_lines.merge(err_lines);

        let mut stdout_lines = Vec::new();
        let mut last_stderr = None;

        loop {
            tokio::select! {
                line = lines.next() => match line {
                    Some(Ok((level, line))) => {
                        logs.send(proto::Log::new(level, line.clone())).await;
                        if level == LogLevel::Warn {
                            if !line.trim().is_empty() {
                                last_stderr = Some(line);
                            }
                        } else {
                            stdout_lines.push(line);
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Failed to read command output");
                    }
                    None => break,
                },
                _ = cancel.cancelled() => {
                    tracing::info!("Killing provisioner command after cancellation");
                    child.kill().await?;
                    return Ok(RunOutcome::Canceled);
                }
            }
        }

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = cancel.cancelled() => {
                child.kill().await?;
                return Ok(RunOutcome::Canceled);
            }
        };

        tracing::info!(exit_code = ?status.code(), success = status.success(), "Provisioner command finished");
        Ok(RunOutcome::Exited {
            success: status.success(),
            exit_code: status.code(),
            stdout: stdout_lines,
            last_stderr,
        })
    }
}

/// `PARAM_` plus the parameter name upper-cased, with anything that is not
/// alphanumeric replaced by `_`.
pub fn env_name(parameter: &str) -> String {
    let name: String = parameter
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("PARAM_{}", name)
}

/// Parse a `resource <type> <name> [<instance-id>]` line.
pub fn parse_resource_line(line: &str) -> Option<Resource> {
    let mut parts = line.split_whitespace();
    if parts.next()? != "resource" {
        return None;
    }
    let resource_type = parts.next()?.to_string();
    let name = parts.next()?.to_string();
    let instance_id = parts.next().map(|id| id.as_bytes().to_vec()).unwrap_or_default();
    Some(Resource {
        name,
        resource_type,
        instance_id,
    })
}

/// Parse a `param <name>[=<default>]` line. Everything after the name and
/// a following space is the description.
pub fn parse_param_line(line: &str) -> Option<ParameterSchema> {
    let rest = line.strip_prefix("param ")?.trim();
    let (spec, description) = match rest.split_once(char::is_whitespace) {
        Some((spec, description)) => (spec, description.trim().to_string()),
        None => (rest, String::new()),
    };
    let (name, default_value) = match spec.split_once('=') {
        Some((name, default)) => (name, Some(default.to_string())),
        None => (spec, None),
    };
    if name.is_empty() {
        return None;
    }
    Some(ParameterSchema {
        name: name.to_string(),
        description,
        required: default_value.is_none(),
        default_value,
    })
}

fn failure_message(exit_code: Option<i32>, last_stderr: Option<String>) -> String {
    last_stderr.unwrap_or_else(|| match exit_code {
        Some(code) => format!("Exit code: {}", code),
        None => "Command terminated by signal".to_string(),
    })
}

#[async_trait]
impl Provisioner for CommandProvisioner {
    async fn parse(&self, request: ParseRequest, logs: LogSink) -> Result<ParseComplete, String> {
        let Some(ref script) = self.config.parse_command else {
            return Ok(ParseComplete::default());
        };
        let cmd = self.command(script, &request.archive_hash, &[], false);
        // Parse cannot be canceled from the control plane
        let never = CancellationToken::new();

        match self.run(cmd, &logs, &never).await {
            Ok(RunOutcome::Exited {
                success: true,
                stdout,
                ..
            }) => Ok(ParseComplete {
                parameter_schemas: stdout.iter().filter_map(|l| parse_param_line(l)).collect(),
            }),
            Ok(RunOutcome::Exited {
                exit_code,
                last_stderr,
                ..
            }) => Err(failure_message(exit_code, last_stderr)),
            Ok(RunOutcome::Canceled) => Err("parse canceled".to_string()),
            Err(e) => {
                tracing::error!(error = %e, "Parse command could not run");
                Err(e.to_string())
            }
        }
    }

    async fn provision(
        &self,
        config: Config,
        logs: LogSink,
        cancel: CancellationToken,
    ) -> ProvisionResult {
        let cmd = self.command(
            &self.config.provision_command,
            &config.archive_hash,
            &config.parameters,
            config.dry_run,
        );

        match self.run(cmd, &logs, &cancel).await {
            Ok(RunOutcome::Exited {
                success: true,
                stdout,
                ..
            }) => ProvisionResult::Complete(ProvisionComplete {
                resources: stdout.iter().filter_map(|l| parse_resource_line(l)).collect(),
            }),
            Ok(RunOutcome::Exited {
                exit_code,
                last_stderr,
                ..
            }) => ProvisionResult::Error(failure_message(exit_code, last_stderr)),
            Ok(RunOutcome::Canceled) => ProvisionResult::Canceled,
            Err(e) => {
                tracing::error!(error = %e, "Provision command could not run");
                ProvisionResult::Error(e.to_string())
            }
        }
    }
}
