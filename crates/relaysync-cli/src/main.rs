//! Relay Synchronization Engine CLI
//!
//! Thin wrapper around relaysync-core for command-line usage.
//!
//! ## Usage
//!
//! ```bash
//! # Register relays
//! relaysync relays add relay.example:7447 --cap 500
//! relaysync relays add hidden.onion:7447 --proxied --budget-ms 300000
//!
//! # Harvest once and print the report
//! relaysync once
//!
//! # Harvest continuously until Ctrl-C
//! relaysync -v run --workers 8 --sessions 16
//!
//! # Inspect progress
//! relaysync watermarks
//! relaysync events count
//! relaysync config show
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use relaysync_core::logging::LoggingBuilder;
use relaysync_core::{
    CycleReport, Relay, RelayId, Storage, SyncConfig, SyncCoordinator, TcpConnector, Timestamp,
    TransportClass, WatermarkStore,
};
use tracing::{info, warn};

/// Relay Synchronization Engine
#[derive(Parser)]
#[command(name = "relaysync")]
#[command(version = "0.1.0")]
#[command(about = "Relay Synchronization Engine - complete harvesting of capped relays")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Data directory (default: ~/.relaysync)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Configuration file (default: <data-dir>/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Also write JSONL logs under this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run cycles until interrupted
    Run(CycleArgs),

    /// Run a single cycle and print its report
    Once(CycleArgs),

    /// Relay directory management
    Relays {
        #[command(subcommand)]
        action: RelaysAction,
    },

    /// Show committed watermarks
    Watermarks,

    /// Stored events
    Events {
        #[command(subcommand)]
        action: EventsAction,
    },

    /// Configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Overrides applied on top of the configuration file
#[derive(Args, Clone, Default)]
struct CycleArgs {
    /// Number of workers
    #[arg(long)]
    workers: Option<usize>,

    /// Concurrent sessions per worker
    #[arg(long)]
    sessions: Option<usize>,

    /// Time between cycle starts, in milliseconds
    #[arg(long)]
    interval_ms: Option<u64>,
}

#[derive(Subcommand)]
enum RelaysAction {
    /// Add or replace a relay
    Add {
        /// Relay address (host:port)
        addr: String,

        /// Reach the relay through the configured SOCKS5 proxy
        #[arg(long)]
        proxied: bool,

        /// Result cap this relay enforces
        #[arg(long)]
        cap: Option<usize>,

        /// Per-cycle time budget, in milliseconds
        #[arg(long)]
        budget_ms: Option<u64>,

        /// Minimum gap between queries, in milliseconds
        #[arg(long)]
        interval_ms: Option<u64>,

        /// Per-query timeout, in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// List all relays
    List,

    /// Stop harvesting a relay
    Disable { addr: String },

    /// Resume harvesting a relay
    Enable { addr: String },
}

#[derive(Subcommand)]
enum EventsAction {
    /// Number of stored events
    Count,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as JSON
    Show,
}

fn setup_logging(verbosity: u8, log_dir: Option<PathBuf>) -> Result<()> {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    LoggingBuilder::new("relaysync")
        .with_filter(filter)
        .with_logs_dir(log_dir)
        .init()
        .context("Failed to initialize logging")?;
    Ok(())
}

/// Get the default data directory (~/.relaysync)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".relaysync")
}

fn load_config(path: &Path, overrides: &CycleArgs) -> Result<SyncConfig> {
    let mut config = SyncConfig::load_or_default(path)?;
    if let Some(workers) = overrides.workers {
        config.workers = workers;
    }
    if let Some(sessions) = overrides.sessions {
        config.sessions_per_worker = sessions;
    }
    if let Some(interval) = overrides.interval_ms {
        config.cycle_interval_ms = interval;
    }
    config.validate()?;
    Ok(config)
}

fn build_coordinator(config: SyncConfig, storage: &Storage) -> Result<Arc<SyncCoordinator>> {
    let connector = TcpConnector::new(config.proxy_addr.clone());
    let store = Arc::new(storage.clone());
    let coordinator = SyncCoordinator::new(
        config,
        store.clone(),
        store.clone(),
        store,
        Arc::new(connector),
    )?;
    Ok(Arc::new(coordinator))
}

/// Request a graceful stop on the first Ctrl-C
fn stop_on_ctrl_c(coordinator: &Arc<SyncCoordinator>) {
    let stop = coordinator.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; finishing current windows");
            stop.cancel();
        }
    });
}

fn print_report(report: &CycleReport) {
    println!("Cycle {}", report.cycle);
    println!("  State:   {}", report.state);
    println!("  Range:   up to {}", report.cycle_end);
    println!(
        "  Relays:  {} drained of {}",
        report.drained(),
        report.sessions.len()
    );
    println!("  Stored:  {} new events", report.stored());
    println!("  Elapsed: {:.1}s", report.elapsed.as_secs_f64());

    if report.sessions.is_empty() {
        return;
    }
    println!();
    for session in &report.sessions {
        let stats = &session.stats;
        println!(
            "  {:<40} {:<10} queries={} stored={} malformed={} retries={}",
            session.relay.as_str(),
            session.outcome.label(),
            stats.queries,
            stats.stored,
            stats.malformed,
            stats.retries
        );
        if !session.outcome.is_drained() {
            println!("    reason: {}", session.outcome);
        }
        for window in &stats.possibly_incomplete {
            println!("    possibly incomplete: {}", window);
        }
    }
}

fn print_relay(relay: &Relay) {
    let o = &relay.overrides;
    let mut extras = Vec::new();
    if let Some(cap) = o.result_cap {
        extras.push(format!("cap={}", cap));
    }
    if let Some(budget) = o.budget_ms {
        extras.push(format!("budget={}ms", budget));
    }
    if let Some(interval) = o.min_interval_ms {
        extras.push(format!("interval={}ms", interval));
    }
    if let Some(timeout) = o.request_timeout_ms {
        extras.push(format!("timeout={}ms", timeout));
    }
    println!(
        "  {:<40} {:<8} {:<8} {}",
        relay.id.as_str(),
        relay.transport,
        if relay.is_enabled() { "enabled" } else { "disabled" },
        extras.join(" ")
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.log_dir.clone())?;

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    let config_path = cli.config.unwrap_or_else(|| data_dir.join("config.json"));

    match cli.command {
        Commands::Config {
            action: ConfigAction::Show,
        } => {
            let config = load_config(&config_path, &CycleArgs::default())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        command => {
            let storage = Storage::new(data_dir.join("relaysync.redb"))
                .with_context(|| format!("Failed to open storage in {}", data_dir.display()))?;
            dispatch(command, &storage, &config_path).await
        }
    }
}

async fn dispatch(command: Commands, storage: &Storage, config_path: &Path) -> Result<()> {
    match command {
        Commands::Run(args) => {
            let config = load_config(config_path, &args)?;
            info!(
                workers = config.workers,
                sessions = config.sessions_per_worker,
                "Starting continuous harvesting"
            );
            let coordinator = build_coordinator(config, storage)?;
            stop_on_ctrl_c(&coordinator);
            coordinator.run().await?;
            println!("Stopped.");
        }

        Commands::Once(args) => {
            let config = load_config(config_path, &args)?;
            let coordinator = build_coordinator(config, storage)?;
            stop_on_ctrl_c(&coordinator);
            let report = coordinator.run_cycle().await?;
            print_report(&report);
        }

        Commands::Relays { action } => match action {
            RelaysAction::Add {
                addr,
                proxied,
                cap,
                budget_ms,
                interval_ms,
                timeout_ms,
            } => {
                let mut relay = Relay::new(addr);
                if proxied {
                    relay = relay.with_transport(TransportClass::Proxied);
                }
                if let Some(cap) = cap {
                    relay = relay.with_result_cap(cap);
                }
                if let Some(ms) = budget_ms {
                    relay = relay.with_budget(Duration::from_millis(ms));
                }
                if let Some(ms) = interval_ms {
                    relay = relay.with_min_interval(Duration::from_millis(ms));
                }
                if let Some(ms) = timeout_ms {
                    relay = relay.with_request_timeout(Duration::from_millis(ms));
                }
                storage.save_relay(&relay)?;
                println!("Added relay {}", relay.id);
            }

            RelaysAction::List => {
                let relays = storage.list_relays()?;
                if relays.is_empty() {
                    println!("No relays. Add one with: relaysync relays add <host:port>");
                } else {
                    println!("Relays ({}):", relays.len());
                    for relay in &relays {
                        print_relay(relay);
                    }
                }
            }

            RelaysAction::Disable { addr } => {
                storage.set_relay_enabled(&RelayId::new(addr.as_str()), false)?;
                println!("Disabled relay {}", addr);
            }

            RelaysAction::Enable { addr } => {
                storage.set_relay_enabled(&RelayId::new(addr.as_str()), true)?;
                println!("Enabled relay {}", addr);
            }
        },

        Commands::Watermarks => {
            let marks = storage.list()?;
            if marks.is_empty() {
                println!("No watermarks yet.");
            } else {
                let now = Timestamp::now();
                println!("Watermarks ({}):", marks.len());
                for (relay, at) in marks {
                    let behind = now.as_secs().saturating_sub(at.as_secs());
                    println!("  {:<40} {} ({}s behind)", relay.as_str(), at, behind);
                }
            }
        }

        Commands::Events {
            action: EventsAction::Count,
        } => {
            println!("{}", storage.count_events()?);
        }

        Commands::Config { .. } => {}
    }
    Ok(())
}
