use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What happens when a job's event buffer is full and the worker produces
/// another log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest retained event. Replays that start before the
    /// oldest retained event resume from it.
    #[default]
    DropOldest,
    /// Keep every event and suspend the appender while the slowest live
    /// stream is `capacity` events behind. This stalls the worker's read
    /// loop.
    Block,
}

/// Per-job event buffer bounds.
#[derive(Debug, Clone)]
pub struct EventBufferConfig {
    pub capacity: usize,
    pub policy: OverflowPolicy,
}

impl Default for EventBufferConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            policy: OverflowPolicy::DropOldest,
        }
    }
}

/// Configuration for the job queue, dispatcher and provisioner sessions.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Maximum number of jobs tracked in memory (pending, running and
    /// unread terminal jobs).
    pub max_jobs: usize,
    /// Largest template archive accepted at submission.
    pub max_archive_bytes: u64,
    /// How long a session waits for a worker to honor `Cancel` before
    /// failing the job with a cancellation timeout.
    pub cancel_grace_period: Duration,
    /// Upper bound on a single Parse or Provision exchange.
    pub max_exchange_duration: Duration,
    /// Safety-net interval for re-running the assignment scan.
    pub dispatch_interval: Duration,
    /// Interval between garbage-collection passes over terminal jobs.
    pub gc_interval: Duration,
    /// Terminal jobs whose result has been read are dropped from memory
    /// once they are older than this.
    pub job_retention: Duration,
    pub events: EventBufferConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_jobs: 10_000,
            max_archive_bytes: 10 * 1024 * 1024,
            cancel_grace_period: Duration::from_secs(30),
            max_exchange_duration: Duration::from_secs(60 * 60),
            dispatch_interval: Duration::from_secs(1),
            gc_interval: Duration::from_secs(60),
            job_retention: Duration::from_secs(10 * 60),
            events: EventBufferConfig::default(),
        }
    }
}

impl DispatchConfig {
    pub fn with_cancel_grace_period(mut self, grace: Duration) -> Self {
        self.cancel_grace_period = grace;
        self
    }

    pub fn with_max_exchange_duration(mut self, max: Duration) -> Self {
        self.max_exchange_duration = max;
        self
    }

    pub fn with_max_archive_bytes(mut self, limit: u64) -> Self {
        self.max_archive_bytes = limit;
        self
    }

    pub fn with_max_jobs(mut self, max_jobs: usize) -> Self {
        self.max_jobs = max_jobs;
        self
    }

    pub fn with_events(mut self, events: EventBufferConfig) -> Self {
        self.events = events;
        self
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Address of the HTTP control API.
    pub api_addr: SocketAddr,
    /// Address workers dial to register.
    pub worker_addr: SocketAddr,
    /// How long a freshly accepted worker connection has to send `Hello`.
    pub hello_timeout: Duration,
    pub dispatch: DispatchConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            // SAFETY: These are hardcoded valid addresses that will always parse
            api_addr: "127.0.0.1:8080"
                .parse()
                .expect("default api address is valid"),
            worker_addr: "127.0.0.1:8090"
                .parse()
                .expect("default worker address is valid"),
            hello_timeout: Duration::from_secs(10),
            dispatch: DispatchConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn new(api_addr: SocketAddr, worker_addr: SocketAddr) -> Self {
        Self {
            api_addr,
            worker_addr,
            ..Default::default()
        }
    }

    pub fn with_dispatch(mut self, dispatch: DispatchConfig) -> Self {
        self.dispatch = dispatch;
        self
    }
}

/// Configuration for the shell-command provisioner backend.
///
/// Commands run through `shell -c`. Parameters are exported as
/// `PARAM_<NAME>` environment variables, the archive hash as
/// `TEMPLATE_ARCHIVE` and dry runs set `DRY_RUN=1`.
#[derive(Debug, Clone)]
pub struct CommandProvisionerConfig {
    pub shell: String,
    /// Command run for `Parse`. Without one, parsing succeeds with an
    /// empty parameter schema.
    pub parse_command: Option<String>,
    pub provision_command: String,
    pub working_dir: Option<PathBuf>,
}

impl Default for CommandProvisionerConfig {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            parse_command: None,
            provision_command: "true".to_string(),
            working_dir: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ProvisionerBackend {
    Echo { step_delay: Duration },
    Command(CommandProvisionerConfig),
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// host:port of the control plane's worker listener
    pub control_plane_addr: String,
    pub name: String,
    pub tags: Vec<String>,
    pub backend: ProvisionerBackend,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            control_plane_addr: "127.0.0.1:8090".to_string(),
            name: "worker".to_string(),
            tags: Vec::new(),
            backend: ProvisionerBackend::Echo {
                step_delay: Duration::from_millis(100),
            },
        }
    }
}

impl WorkerConfig {
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}
