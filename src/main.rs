use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use buildfleet::config::{DispatchConfig, FleetFile, ResumeConfig};
use buildfleet::fleet::{Fleet, Vitals, Worker};
use buildfleet::lifecycle::HostController;
use buildfleet::node::Node;
use buildfleet::proxy::{GrpcWorkerProxy, WorkerProxy};
use buildfleet::scheduler::{BehaviourRegistry, StagedBuildBehaviour};
use buildfleet::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "buildfleet")]
#[command(version)]
#[command(about = "Dispatches build jobs to a fleet of remote build workers")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Scan the fleet: clean workers and dispatch jobs until stopped
    Serve(ServeArgs),

    /// Talk to a single worker agent
    Probe {
        /// Worker agent URL
        #[arg(long)]
        url: String,

        #[command(flatten)]
        timeouts: TimeoutArgs,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,

        #[command(subcommand)]
        command: ProbeCommands,
    },
}

// =============================================================================
// Arguments
// =============================================================================

#[derive(clap::Args, Debug)]
struct TimeoutArgs {
    /// Seconds allowed for one call's round trip
    #[arg(long, default_value = "30")]
    call_timeout_secs: u64,

    /// Seconds allowed to establish a connection
    #[arg(long, default_value = "30")]
    connect_timeout_secs: u64,
}

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Fleet definition (JSON): workers and optional seed jobs
    #[arg(long)]
    fleet: PathBuf,

    #[command(flatten)]
    timeouts: TimeoutArgs,

    /// Concurrent file transfers per remote host
    #[arg(long, default_value = "10")]
    transfer_pool_size: usize,

    /// Milliseconds between fleet scans
    #[arg(long, default_value = "15000")]
    scan_interval_ms: u64,

    /// Consecutive failures before a worker is disabled
    #[arg(long, default_value = "5")]
    max_failures: u32,

    /// Directory finished builds' files are collected into, one subdirectory per job
    #[arg(long, default_value = "results")]
    results_dir: PathBuf,

    /// Build types dispatched with the staged-input behaviour
    #[arg(long = "build-type", default_value = "binarypackage")]
    build_types: Vec<String>,

    /// Host resume command; {worker_name} and {vm_host} are substituted
    #[arg(long, num_args = 1.., allow_hyphen_values = true)]
    resume_command: Option<Vec<String>>,
}

#[derive(clap::Subcommand, Debug)]
enum ProbeCommands {
    /// Round-trip arguments through the agent
    Echo { args: Vec<String> },
    /// Protocol version, architecture and supported build types
    Info,
    /// What the agent is doing
    Status,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct InfoOutput {
    protocol_version: String,
    arch_tag: String,
    build_types: Vec<String>,
}

#[derive(Serialize)]
struct StatusOutput {
    builder_status: String,
    build_id: Option<String>,
    build_status: Option<String>,
    logtail: Option<String>,
    filemap: std::collections::BTreeMap<String, String>,
}

fn dispatch_config(timeouts: &TimeoutArgs) -> DispatchConfig {
    DispatchConfig::default()
        .with_call_timeout(Duration::from_secs(timeouts.call_timeout_secs))
        .with_connection_timeout(Duration::from_secs(timeouts.connect_timeout_secs))
}

// =============================================================================
// Serve
// =============================================================================

async fn run_serve(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = dispatch_config(&args.timeouts)
        .with_transfer_pool_size(args.transfer_pool_size)
        .with_results_dir(args.results_dir);
    config.scan_interval = Duration::from_millis(args.scan_interval_ms);
    config.max_failures = args.max_failures;
    if let Some(argv) = args.resume_command {
        config = config.with_resume(ResumeConfig::new(argv));
    }

    let (workers, jobs) = FleetFile::load(&args.fleet).await?.into_parts();
    let mut fleet = Fleet::new();
    for worker in workers {
        fleet.add_worker(worker);
    }
    for job in jobs {
        if !fleet.add_job(job) {
            tracing::warn!("Job queue at capacity, seed job dropped");
        }
    }

    let behaviours = args
        .build_types
        .iter()
        .fold(BehaviourRegistry::new(), |registry, build_type| {
            registry.register(Arc::new(StagedBuildBehaviour::new(build_type.clone())))
        });

    tracing::info!(
        fleet = %args.fleet.display(),
        build_types = ?args.build_types,
        "Loaded fleet definition"
    );

    let shutdown = install_shutdown_handler()?;
    let node = Node::new(config, fleet, behaviours)?;
    node.run(shutdown).await;
    Ok(())
}

// =============================================================================
// Probe
// =============================================================================

async fn run_probe(
    url: String,
    timeouts: TimeoutArgs,
    output: OutputFormat,
    command: ProbeCommands,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = dispatch_config(&timeouts);
    let vitals = Vitals::capture(&Worker::new("probe", url, Vec::new()), None);
    let host = Arc::new(HostController::new(config.resume.clone(), config.call_timeout));
    let proxy = GrpcWorkerProxy::new(vitals, &config, host)?;

    match command {
        ProbeCommands::Echo { args } => {
            let echoed = proxy.echo(args).await?;
            match output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&echoed)?),
                OutputFormat::Table => println!("{}", echoed.join(" ")),
            }
        }
        ProbeCommands::Info => {
            let info = proxy.info().await?;
            match output {
                OutputFormat::Json => {
                    let out = InfoOutput {
                        protocol_version: info.protocol_version,
                        arch_tag: info.arch_tag,
                        build_types: info.build_types,
                    };
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
                OutputFormat::Table => {
                    println!("Protocol:    {}", info.protocol_version);
                    println!("Arch:        {}", info.arch_tag);
                    println!("Build types: {}", info.build_types.join(", "));
                }
            }
        }
        ProbeCommands::Status => {
            let status = proxy.status().await?;
            match output {
                OutputFormat::Json => {
                    let out = StatusOutput {
                        builder_status: status.builder_status.to_string(),
                        build_id: status.build_id,
                        build_status: status.build_status,
                        logtail: status.logtail,
                        filemap: status.filemap,
                    };
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
                OutputFormat::Table => {
                    println!("Builder status: {}", status.builder_status);
                    if let Some(build_id) = &status.build_id {
                        println!("Build ID:       {}", build_id);
                    }
                    if let Some(build_status) = &status.build_status {
                        println!("Build status:   {}", build_status);
                    }
                    for (name, sha1) in &status.filemap {
                        println!("  {:<40} {}", name, sha1);
                    }
                    if let Some(logtail) = &status.logtail {
                        println!("Log tail:");
                        for line in logtail.lines() {
                            println!("  {}", line);
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Serve(serve_args) => run_serve(serve_args).await?,
        Commands::Probe {
            url,
            timeouts,
            output,
            command,
        } => run_probe(url, timeouts, output, command).await?,
    }

    Ok(())
}
