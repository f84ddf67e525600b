//! Wire messages exchanged between the control plane and provisioner workers.
//!
//! These are prost messages maintained by hand; field tags are part of the
//! wire contract and must never be reused. Every frame on a worker
//! connection is either a [`ServerMessage`] (control plane to worker) or a
//! [`WorkerMessage`] (worker to control plane).

use std::collections::HashMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

/// A line of output produced while parsing or provisioning.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Log {
    #[prost(enumeration = "LogLevel", tag = "1")]
    pub level: i32,
    #[prost(string, tag = "2")]
    pub output: String,
    #[prost(map = "string, string", tag = "3")]
    pub fields: HashMap<String, String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ParameterValue {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ParameterSchema {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub description: String,
    #[prost(string, optional, tag = "3")]
    pub default_value: Option<String>,
    #[prost(bool, tag = "4")]
    pub required: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Resource {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub resource_type: String,
    /// Opaque provider identifier, carried byte for byte.
    #[prost(bytes = "vec", tag = "3")]
    pub instance_id: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ExchangeError {
    #[prost(string, tag = "1")]
    pub message: String,
}

// === Parse ===

#[derive(Clone, PartialEq, prost::Message)]
pub struct ParseRequest {
    #[prost(string, tag = "1")]
    pub archive_hash: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ParseComplete {
    #[prost(message, repeated, tag = "1")]
    pub parameter_schemas: Vec<ParameterSchema>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ParseResponse {
    #[prost(oneof = "parse_response::Event", tags = "1, 2, 3")]
    pub event: Option<parse_response::Event>,
}

pub mod parse_response {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Event {
        #[prost(message, tag = "1")]
        Log(super::Log),
        #[prost(message, tag = "2")]
        Complete(super::ParseComplete),
        #[prost(message, tag = "3")]
        Error(super::ExchangeError),
    }
}

// === Provision ===

#[derive(Clone, PartialEq, prost::Message)]
pub struct Config {
    #[prost(string, tag = "1")]
    pub archive_hash: String,
    #[prost(message, repeated, tag = "2")]
    pub parameters: Vec<ParameterValue>,
    /// Plan only; nothing is applied.
    #[prost(bool, tag = "3")]
    pub dry_run: bool,
}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct Cancel {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ProvisionRequest {
    #[prost(oneof = "provision_request::Directive", tags = "1, 2")]
    pub directive: Option<provision_request::Directive>,
}

pub mod provision_request {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Directive {
        #[prost(message, tag = "1")]
        Config(super::Config),
        #[prost(message, tag = "2")]
        Cancel(super::Cancel),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ProvisionComplete {
    #[prost(message, repeated, tag = "1")]
    pub resources: Vec<Resource>,
}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct Canceled {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ProvisionResponse {
    #[prost(oneof = "provision_response::Event", tags = "1, 2, 3, 4")]
    pub event: Option<provision_response::Event>,
}

pub mod provision_response {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Event {
        #[prost(message, tag = "1")]
        Log(super::Log),
        #[prost(message, tag = "2")]
        Complete(super::ProvisionComplete),
        #[prost(message, tag = "3")]
        Error(super::ExchangeError),
        #[prost(message, tag = "4")]
        Canceled(super::Canceled),
    }
}

// === Connection envelope ===

/// First message a worker sends after connecting.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Hello {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, repeated, tag = "2")]
    pub tags: Vec<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ServerMessage {
    #[prost(oneof = "server_message::Message", tags = "1, 2")]
    pub message: Option<server_message::Message>,
}

pub mod server_message {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Message {
        #[prost(message, tag = "1")]
        Parse(super::ParseRequest),
        #[prost(message, tag = "2")]
        Provision(super::ProvisionRequest),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WorkerMessage {
    #[prost(oneof = "worker_message::Message", tags = "1, 2, 3")]
    pub message: Option<worker_message::Message>,
}

pub mod worker_message {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Message {
        #[prost(message, tag = "1")]
        Hello(super::Hello),
        #[prost(message, tag = "2")]
        Parse(super::ParseResponse),
        #[prost(message, tag = "3")]
        Provision(super::ProvisionResponse),
    }
}

impl Log {
    pub fn new(level: LogLevel, output: impl Into<String>) -> Self {
        Self {
            level: level as i32,
            output: output.into(),
            fields: HashMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

impl ServerMessage {
    pub fn parse(request: ParseRequest) -> Self {
        Self {
            message: Some(server_message::Message::Parse(request)),
        }
    }

    pub fn provision_config(config: Config) -> Self {
        Self {
            message: Some(server_message::Message::Provision(ProvisionRequest {
                directive: Some(provision_request::Directive::Config(config)),
            })),
        }
    }

    pub fn provision_cancel() -> Self {
        Self {
            message: Some(server_message::Message::Provision(ProvisionRequest {
                directive: Some(provision_request::Directive::Cancel(Cancel {})),
            })),
        }
    }
}

impl WorkerMessage {
    pub fn hello(name: impl Into<String>, tags: Vec<String>) -> Self {
        Self {
            message: Some(worker_message::Message::Hello(Hello {
                name: name.into(),
                tags,
            })),
        }
    }

    pub fn parse(event: parse_response::Event) -> Self {
        Self {
            message: Some(worker_message::Message::Parse(ParseResponse {
                event: Some(event),
            })),
        }
    }

    pub fn provision(event: provision_response::Event) -> Self {
        Self {
            message: Some(worker_message::Message::Provision(ProvisionResponse {
                event: Some(event),
            })),
        }
    }
}

impl parse_response::Event {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, parse_response::Event::Log(_))
    }
}

impl provision_response::Event {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, provision_response::Event::Log(_))
    }
}
