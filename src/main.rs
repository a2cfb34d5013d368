use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use serde_json::{Map, Value};
use tracing_subscriber::EnvFilter;

use framefarm::config::{FarmConfig, TimingConfig};
use framefarm::console::{self, Command};
use framefarm::ingest::{DescriptorId, JobDescriptor};
use framefarm::node::Node;
use framefarm::scheduler::{ClientStatus, FrameRange};
use framefarm::store::Store;
use framefarm::supervisor::install_shutdown_handler;
use framefarm::worker::default_adapters;

#[derive(Parser, Debug)]
#[command(name = "framefarm")]
#[command(version)]
#[command(about = "A render farm: one coordinator, many workers, frame-range jobs")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Join the farm; coordinates if this machine wins the lock, works otherwise
    Node(NodeArgs),

    /// Inspect and steer a running farm
    Console {
        #[command(flatten)]
        farm: FarmArgs,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,

        #[command(subcommand)]
        command: ConsoleCommands,
    },

    /// Drop a job descriptor into the drop directory
    Submit(SubmitArgs),
}

// =============================================================================
// Shared farm arguments
// =============================================================================

#[derive(Parser, Debug)]
struct FarmArgs {
    /// Display name of this machine, unique on the farm
    #[arg(long)]
    name: Option<String>,

    /// Shared farm secret
    #[arg(long, default_value = "")]
    secret: String,

    /// Shared SQLite database used for coordinator election
    #[arg(long, default_value = "framefarm.db")]
    db: PathBuf,

    /// Never touch the database; only dial --server
    #[arg(long)]
    no_db: bool,

    /// Coordinator address to try before looking at the lock
    #[arg(long)]
    server: Option<String>,
}

impl FarmArgs {
    fn config(&self, default_name: &str, listen_addr: SocketAddr) -> FarmConfig {
        let name = self.name.clone().unwrap_or_else(|| {
            std::env::var("HOSTNAME").unwrap_or_else(|_| default_name.to_string())
        });
        let mut config = FarmConfig::new(name, listen_addr).with_secret(self.secret.clone());
        config = if self.no_db {
            config.without_db()
        } else {
            config.with_db_path(self.db.clone())
        };
        if let Some(server) = &self.server {
            config = config.with_last_known_server(server.clone());
        }
        config
    }
}

// =============================================================================
// Node Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct NodeArgs {
    #[command(flatten)]
    farm: FarmArgs,

    /// Port the coordinator endpoint listens on when this node coordinates
    #[arg(long, default_value = "9440")]
    port: u16,

    /// Address other machines use to reach this one (default: 127.0.0.1:<port>)
    #[arg(long)]
    advertise: Option<String>,

    /// Directory scanned for job descriptors while coordinating
    #[arg(long, default_value = "dropbox")]
    drop_dir: PathBuf,

    /// Scheduling interval in milliseconds
    #[arg(long, default_value = "1000")]
    schedule_interval_ms: u64,

    /// Drop directory scan interval in milliseconds
    #[arg(long, default_value = "2000")]
    ingest_interval_ms: u64,
}

// =============================================================================
// Console Commands
// =============================================================================

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum ConsoleCommands {
    /// Print farm events as they happen
    Watch,
    /// List connected workers
    Clients,
    /// List jobs
    Jobs,
    /// Requeue a failed allocation
    Retry {
        /// Allocation id
        allocation: i64,
    },
    /// Stop handing work to matching workers
    Pause {
        /// Worker names, e.g. "render[01-12]" or "node-*"
        classifier: String,
    },
    /// Resume matching workers
    Resume {
        /// Worker names, e.g. "render[01-12]" or "node-*"
        classifier: String,
    },
}

impl From<ConsoleCommands> for Command {
    fn from(command: ConsoleCommands) -> Self {
        match command {
            ConsoleCommands::Watch => Command::Watch,
            ConsoleCommands::Clients => Command::Clients,
            ConsoleCommands::Jobs => Command::Jobs,
            ConsoleCommands::Retry { allocation } => Command::Retry { allocation },
            ConsoleCommands::Pause { classifier } => Command::SetStatus {
                classifier,
                status: ClientStatus::Stopped,
            },
            ConsoleCommands::Resume { classifier } => Command::SetStatus {
                classifier,
                status: ClientStatus::Idle,
            },
        }
    }
}

// =============================================================================
// Submit Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct SubmitArgs {
    /// Job name
    name: String,

    /// Frame range, e.g. "1-100" or "1-100:2"
    #[arg(long, short = 'r')]
    range: String,

    /// Job type; selects the worker adapter
    #[arg(long = "type", short = 't', default_value = "shell")]
    kind: String,

    /// Job purpose: render, cache or simulation
    #[arg(long, default_value = "render")]
    purpose: String,

    /// Frames per allocation
    #[arg(long)]
    allocation: Option<usize>,

    /// Adapter parameter, KEY=VALUE (repeatable)
    #[arg(long = "param", short = 'p')]
    params: Vec<String>,

    /// Environment variable for the job, KEY=VALUE (repeatable)
    #[arg(long = "env", short = 'e')]
    envs: Vec<String>,

    /// Submitter identity the job id is derived from
    #[arg(long, default_value = "framefarm")]
    submitter: String,

    /// Drop directory the coordinator scans
    #[arg(long, default_value = "dropbox")]
    drop_dir: PathBuf,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn parse_pairs(pairs: &[String]) -> Result<Map<String, Value>, Box<dyn std::error::Error>> {
    pairs
        .iter()
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                Ok((key.to_string(), Value::String(value.to_string())))
            }
            _ => Err(Box::<dyn std::error::Error>::from(format!(
                "expected KEY=VALUE, got `{pair}`"
            ))),
        })
        .collect()
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn run_node(args: NodeArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let timing = TimingConfig {
        schedule_interval_ms: args.schedule_interval_ms,
        ingest_interval_ms: args.ingest_interval_ms,
        ..TimingConfig::default()
    };
    let config = args
        .farm
        .config("localhost", listen_addr)
        .with_advertise_addr(
            args.advertise
                .unwrap_or_else(|| format!("127.0.0.1:{}", args.port)),
        )
        .with_drop_dir(args.drop_dir)
        .with_timing(timing);

    let token = install_shutdown_handler();
    let node = Node::new(config, default_adapters())?;
    node.run(token).await?;
    Ok(())
}

async fn run_console(
    farm: FarmArgs,
    output: OutputFormat,
    command: ConsoleCommands,
) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let listen_addr: SocketAddr = "0.0.0.0:0".parse()?;
    let config = farm.config("console", listen_addr);
    let store = config.db_path.as_deref().map(Store::open).transpose()?;
    let token = install_shutdown_handler();

    console::run(
        &config,
        store.as_ref(),
        command.into(),
        matches!(output, OutputFormat::Json),
        &token,
    )
    .await?;
    Ok(())
}

async fn run_submit(args: SubmitArgs) -> Result<(), Box<dyn std::error::Error>> {
    // Fail here rather than in the coordinator's drop directory.
    FrameRange::parse(&args.range)?;

    let descriptor = JobDescriptor {
        name: args.name,
        purpose: args.purpose,
        kind: args.kind,
        metadata: Map::new(),
        range: args.range,
        id: DescriptorId::Submitter(args.submitter),
        environment: parse_pairs(&args.envs)?,
        dependencies: Vec::new(),
        parameters: parse_pairs(&args.params)?,
        allocation: args.allocation,
    };
    let path = descriptor.write_to(&args.drop_dir).await?;

    println!("Job submitted successfully!");
    println!("Descriptor: {}", path.display());
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Node(args) => run_node(args).await,
        Commands::Console {
            farm,
            output,
            command,
        } => run_console(farm, output, command).await,
        Commands::Submit(args) => run_submit(args).await,
    }
}
