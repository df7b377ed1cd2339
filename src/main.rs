//! CLI entry point for daq_fleet.
//!
//! # Usage
//!
//! Launch a fleet, record for ten seconds and shut down:
//! ```bash
//! daq_fleet run --config fleet.toml --duration-secs 10
//! ```
//!
//! Print the resolved wiring without starting anything:
//! ```bash
//! daq_fleet topology --config fleet.toml
//! ```
//!
//! `daq_fleet participant` is what the orchestrator re-executes for every worker and saver;
//! it reads its spec from stdin and is not meant to be run by hand.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use daq_fleet::config::FleetConfig;
use daq_fleet::orchestrator::Orchestrator;
use daq_fleet::recording::BackendRegistry;
use daq_fleet::supervisor::{self, ParticipantLauncher};
use daq_fleet::topology::Topology;
use daq_fleet::workers::WorkerRegistry;
use daq_fleet::logging;
use mimalloc::MiMalloc;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "daq_fleet")]
#[command(about = "Coordinates a fleet of data-acquisition workers and savers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the fleet, record, then shut down
    Run {
        /// Fleet configuration file (TOML)
        #[arg(long)]
        config: PathBuf,

        /// Record for this many seconds; without it, record until Ctrl+C
        #[arg(long)]
        duration_secs: Option<u64>,
    },

    /// Print the resolved wiring
    Topology {
        #[arg(long)]
        config: PathBuf,
    },

    /// Run one participant process, driven over stdin and stdout
    #[command(hide = true)]
    Participant,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            duration_secs,
        } => run(config, duration_secs.map(Duration::from_secs)).await,
        Commands::Topology { config } => print_topology(config),
        Commands::Participant => participant().await,
    }
}

/// Exits the process directly: the stdin reader blocks the runtime's shutdown otherwise.
async fn participant() -> Result<()> {
    let code = match supervisor::serve(&WorkerRegistry::new(), &BackendRegistry::new()).await {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "participant failed");
            eprintln!("participant failed: {e}");
            1
        }
    };
    std::process::exit(code)
}

fn load(path: &PathBuf) -> Result<FleetConfig> {
    let config = FleetConfig::load(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

async fn run(path: PathBuf, duration: Option<Duration>) -> Result<()> {
    let config = load(&path)?;
    logging::init_from_config(&config.logging).map_err(anyhow::Error::msg)?;
    let join_timeout = config.handshake.join_timeout;

    let recording = config.gui_params.clone();

    let mut fleet = Orchestrator::launch(
        config,
        &WorkerRegistry::new(),
        &BackendRegistry::new(),
        ParticipantLauncher::current_exe()?,
    )
    .await?;
    let report = fleet.connect().await;
    if !report.is_complete() {
        warn!(
            unresponsive = report.unresponsive.len(),
            exited = report.exited.len(),
            "continuing with an incompletely connected fleet"
        );
    }

    fleet.start_recording(recording.directory, recording.filename)?;
    let started = Instant::now();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        if duration.is_some_and(|d| started.elapsed() >= d) {
            info!("recording duration reached");
            break;
        }
        if !fleet.shutdown_requests().is_empty() {
            warn!("shutting down on participant request");
            break;
        }
        fleet.check_triggers()?;
        let wait = fleet
            .next_trigger_in()
            .unwrap_or(Duration::from_millis(100))
            .min(Duration::from_millis(100));
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("interrupted");
                break;
            }
            _ = fleet.poll(wait) => {}
        }
    }

    fleet.stop_recording()?;
    fleet.shutdown(join_timeout).await?;
    Ok(())
}

fn print_topology(path: PathBuf) -> Result<()> {
    let config = load(&path)?;
    let topology = Topology::build(&config)?;
    for name in topology.order() {
        let Some(wiring) = topology.wiring(name) else {
            continue;
        };
        println!("{} ({:?}) at {}", wiring.name, wiring.role, wiring.address);
        for sub in &wiring.subscriptions {
            let kinds: Vec<String> = sub.kinds.iter().map(|k| k.to_string()).collect();
            println!("  subscribes {} at {} [{}]", sub.producer, sub.address, kinds.join(", "));
        }
        for peer in &wiring.peers {
            println!("  peer {} at {}", peer.peer, peer.address);
        }
    }
    Ok(())
}
