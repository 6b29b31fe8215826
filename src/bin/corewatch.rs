//! corewatch - command line client for the corewatch daemon
//!
//! # Usage
//!
//! ```text
//! corewatch start [CONFIG]       # start the core (auto-starts corewatchd)
//! corewatch start --allow-lan    # listen on all interfaces
//! corewatch stop                 # stop the core, clear the system proxy
//! corewatch restart              # restart with the same config
//! corewatch status               # core and daemon state
//! corewatch monitor start        # stream the core's connection log
//! corewatch monitor snapshot     # top domains, node groups, ...
//! corewatch follow               # print events as they happen
//! ```

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use corewatch_cli::client::FollowUpdate;
use corewatch_cli::daemon;
use corewatch_cli::format::{format_event, format_monitor, format_snapshot, format_status};
use corewatch_cli::{CliError, ClientConfig, DaemonClient, EventFollower};
use corewatchd::config::DaemonConfig;

// ============================================================================
// CLI Arguments
// ============================================================================

/// corewatch - control a local proxy core through corewatchd
#[derive(Parser, Debug)]
#[command(name = "corewatch")]
#[command(about = "Start, stop and watch a local proxy core")]
#[command(version)]
struct Args {
    /// Daemon configuration file (also passed on when auto-starting corewatchd)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Daemon socket path (overrides the daemon configuration)
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the core, replacing a running one
    Start {
        /// Core configuration file (defaults to the daemon's configured one)
        core_config: Option<PathBuf>,

        /// Accept connections from other hosts
        #[arg(long)]
        allow_lan: bool,

        /// Point the system proxy at the core
        #[arg(long)]
        system_proxy: bool,
    },
    /// Stop the core
    Stop,
    /// Restart the core with its last configuration
    Restart,
    /// Show core and daemon state
    Status,
    /// Control the connection-log monitor
    Monitor {
        #[command(subcommand)]
        action: MonitorAction,
    },
    /// Print daemon events until interrupted
    Follow,
}

#[derive(Subcommand, Debug)]
enum MonitorAction {
    /// Start (or resume) streaming the connection log
    Start,
    /// Stop delivering entries; the stream is kept open for a while
    Stop,
    /// Drop the collected history and group counts
    Clear,
    /// Show collected connection groups
    Snapshot {
        /// Number of groups shown per dimension
        #[arg(long, default_value_t = 10)]
        top: usize,
    },
}

// ============================================================================
// Helpers
// ============================================================================

fn socket_path(args: &Args) -> PathBuf {
    if let Some(path) = &args.socket {
        return path.clone();
    }
    match DaemonConfig::load(args.config.as_deref()) {
        Ok(config) => config.socket_path(),
        Err(e) => {
            warn!(error = %e, "Failed to load daemon configuration, using default socket");
            DaemonConfig::default().socket_path()
        }
    }
}

fn start_overrides(allow_lan: bool, system_proxy: bool) -> HashMap<String, Value> {
    let mut overrides = HashMap::new();
    if allow_lan {
        overrides.insert("allowLan".to_string(), Value::Bool(true));
    }
    if system_proxy {
        overrides.insert("systemProxy".to_string(), Value::Bool(true));
    }
    overrides
}

/// Turns a client error into a message with a hint where one helps.
fn explain(error: CliError) -> anyhow::Error {
    let code = error.code().map(str::to_owned);
    match code.as_deref() {
        Some("not-installed") => {
            anyhow::anyhow!("{error}\nhint: set core.binary in the daemon configuration")
        }
        Some("config-invalid") => anyhow::anyhow!("{error}\nhint: check the core configuration file"),
        Some("core-not-running") => anyhow::anyhow!("{error}\nhint: run `corewatch start` first"),
        _ if error.is_connection() => {
            anyhow::anyhow!("{error}\nhint: is corewatchd running? try `corewatchd start -d`")
        }
        _ => error.into(),
    }
}

async fn connect(config: &ClientConfig) -> Result<DaemonClient> {
    DaemonClient::connect(config).await.map_err(explain)
}

// ============================================================================
// Commands
// ============================================================================

async fn run_command(args: Args) -> Result<()> {
    let config = ClientConfig::with_socket(socket_path(&args));
    debug!(socket = %config.socket_path.display(), "Using daemon socket");

    match args.command {
        Command::Start {
            core_config,
            allow_lan,
            system_proxy,
        } => {
            if let Err(e) = daemon::ensure_daemon_running(&config.socket_path, args.config.as_deref()).await {
                bail!("Failed to ensure daemon is running: {e}");
            }
            let mut client = connect(&config).await?;
            let (pid, port) = client
                .start_core(core_config, start_overrides(allow_lan, system_proxy))
                .await
                .map_err(explain)?;
            println!("core started (pid {pid}, port {port})");
            client.disconnect().await;
        }
        Command::Stop => {
            let mut client = connect(&config).await?;
            let message = client.stop_core().await.map_err(explain)?;
            println!("{message}");
            client.disconnect().await;
        }
        Command::Restart => {
            let mut client = connect(&config).await?;
            let (pid, port) = client.restart_core().await.map_err(explain)?;
            println!("core restarted (pid {pid}, port {port})");
            client.disconnect().await;
        }
        Command::Status => {
            let mut client = connect(&config).await?;
            let (status, state) = client.status().await.map_err(explain)?;
            println!("{}", format_status(&status, &state, chrono::Utc::now()));
            client.disconnect().await;
        }
        Command::Monitor { action } => {
            let mut client = connect(&config).await?;
            match action {
                MonitorAction::Start => {
                    let (phase, monitoring) = client.start_monitoring().await.map_err(explain)?;
                    println!("{}", format_monitor(phase, &monitoring));
                }
                MonitorAction::Stop => {
                    let (phase, monitoring) = client.stop_monitoring().await.map_err(explain)?;
                    println!("{}", format_monitor(phase, &monitoring));
                }
                MonitorAction::Clear => {
                    client.clear_connection_history().await.map_err(explain)?;
                    println!("connection history cleared");
                }
                MonitorAction::Snapshot { top } => {
                    let snapshot = client.connection_snapshot().await.map_err(explain)?;
                    println!("{}", format_snapshot(&snapshot, top));
                }
            }
            client.disconnect().await;
        }
        Command::Follow => follow(config).await?,
    }

    Ok(())
}

async fn follow(config: ClientConfig) -> Result<()> {
    let cancel_token = CancellationToken::new();

    let ctrl_c_token = cancel_token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted");
        }
        ctrl_c_token.cancel();
    });

    let follower = EventFollower::new(config, cancel_token);
    follower
        .run(|update| match update {
            FollowUpdate::Connected { client_id } => {
                eprintln!("-- connected as {client_id}");
            }
            FollowUpdate::Event(event) => match (format_event(&event), event.error_kind()) {
                (Some(line), Some(kind)) => eprintln!("{kind}: {line}"),
                (Some(line), None) => println!("{line}"),
                (None, _) => {}
            },
            FollowUpdate::Disconnected => {
                eprintln!("-- daemon disconnected, reconnecting");
            }
        })
        .await
        .map_err(explain)
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Diagnostics go to stderr so command output stays scriptable.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    run_command(args).await
}
