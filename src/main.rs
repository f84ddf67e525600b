use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use provisioner_lite::config::{
    CommandProvisionerConfig, DispatchConfig, EventBufferConfig, NodeConfig, OverflowPolicy,
    ProvisionerBackend, WorkerConfig,
};
use provisioner_lite::node::Node;
use provisioner_lite::shutdown::install_shutdown_handler;
use provisioner_lite::worker::run_worker;

#[derive(Parser, Debug)]
#[command(name = "provisioner-lite")]
#[command(version)]
#[command(about = "A control plane that dispatches template jobs to provisioner workers")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the control plane
    Server(ServerArgs),

    /// Start a provisioner worker and connect it to a control plane
    Worker(WorkerArgs),
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address of the HTTP control API
    #[arg(long, default_value = "127.0.0.1:8080")]
    api_addr: SocketAddr,

    /// Address provisioner workers connect to
    #[arg(long, default_value = "127.0.0.1:8090")]
    worker_addr: SocketAddr,

    /// Maximum number of jobs kept in memory
    #[arg(long, default_value = "10000")]
    max_jobs: usize,

    /// Largest accepted template archive, in bytes
    #[arg(long, default_value = "10485760")]
    max_archive_bytes: u64,

    /// Seconds a worker has to honor a cancellation
    #[arg(long, default_value = "30")]
    cancel_grace_secs: u64,

    /// Upper bound on a single parse or provision exchange, in seconds
    #[arg(long, default_value = "3600")]
    max_exchange_secs: u64,

    /// Log events retained per job
    #[arg(long, default_value = "10000")]
    event_buffer: usize,

    /// What to do when a job's event buffer is full
    #[arg(long, value_enum, default_value = "drop-oldest")]
    overflow: OverflowArg,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OverflowArg {
    DropOldest,
    Block,
}

impl From<OverflowArg> for OverflowPolicy {
    fn from(arg: OverflowArg) -> Self {
        match arg {
            OverflowArg::DropOldest => OverflowPolicy::DropOldest,
            OverflowArg::Block => OverflowPolicy::Block,
        }
    }
}

// =============================================================================
// Worker Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Control plane worker address (host:port)
    #[arg(long, short = 'a', default_value = "127.0.0.1:8090")]
    addr: String,

    /// Name reported to the control plane
    #[arg(long, default_value = "worker")]
    name: String,

    /// Capability tags (comma-separated), e.g. "docker,gpu"
    #[arg(long, value_delimiter = ',')]
    tags: Vec<String>,

    /// Provisioner backend
    #[arg(long, value_enum, default_value = "echo")]
    backend: BackendArg,

    /// Delay between echo provisioner steps, in milliseconds
    #[arg(long, default_value = "100")]
    step_delay_ms: u64,

    /// Shell used by the command backend
    #[arg(long, default_value = "sh")]
    shell: String,

    /// Command run for parse (command backend)
    #[arg(long)]
    parse_command: Option<String>,

    /// Command run for provision (command backend)
    #[arg(long, default_value = "true")]
    provision_command: String,

    /// Working directory for commands
    #[arg(long)]
    working_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendArg {
    Echo,
    Command,
}

// =============================================================================
// Entry points
// =============================================================================

async fn run_server(
    args: ServerArgs,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let dispatch = DispatchConfig::default()
        .with_max_jobs(args.max_jobs)
        .with_max_archive_bytes(args.max_archive_bytes)
        .with_cancel_grace_period(Duration::from_secs(args.cancel_grace_secs))
        .with_max_exchange_duration(Duration::from_secs(args.max_exchange_secs))
        .with_events(EventBufferConfig {
            capacity: args.event_buffer,
            policy: args.overflow.into(),
        });
    let config = NodeConfig::new(args.api_addr, args.worker_addr).with_dispatch(dispatch);

    tracing::info!(
        api_addr = %config.api_addr,
        worker_addr = %config.worker_addr,
        max_jobs = config.dispatch.max_jobs,
        overflow = ?config.dispatch.events.policy,
        "Starting provisioner-lite control plane"
    );

    let node = Node::new(config).await?;
    node.run(shutdown).await?;
    Ok(())
}

async fn run_worker_command(
    args: WorkerArgs,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let backend = match args.backend {
        BackendArg::Echo => ProvisionerBackend::Echo {
            step_delay: Duration::from_millis(args.step_delay_ms),
        },
        BackendArg::Command => ProvisionerBackend::Command(CommandProvisionerConfig {
            shell: args.shell,
            parse_command: args.parse_command,
            provision_command: args.provision_command,
            working_dir: args.working_dir,
        }),
    };
    let config = WorkerConfig {
        control_plane_addr: args.addr,
        name: args.name,
        tags: args.tags,
        backend,
    };

    tracing::info!(
        addr = %config.control_plane_addr,
        name = %config.name,
        tags = ?config.tags,
        "Starting provisioner worker"
    );

    run_worker(config, shutdown).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let shutdown = CancellationToken::new();
    install_shutdown_handler(shutdown.clone())?;

    match args.command {
        Commands::Server(server_args) => run_server(server_args, shutdown).await?,
        Commands::Worker(worker_args) => run_worker_command(worker_args, shutdown).await?,
    }

    Ok(())
}
