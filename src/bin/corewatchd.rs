//! corewatch daemon - supervises the proxy core and serves clients
//!
//! This binary runs the core supervisor, the connection-log monitor and the
//! Unix socket server that the `corewatch` CLI talks to.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (foreground)
//! corewatchd start
//!
//! # Start the daemon (background/daemonized)
//! corewatchd start -d
//!
//! # Use a specific configuration file
//! corewatchd --config ~/.config/corewatch/config.toml start
//!
//! # Stop the daemon (stops the core and clears the system proxy)
//! corewatchd stop
//!
//! # Check daemon status
//! corewatchd status
//! ```

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use corewatchd::config::DaemonConfig;
use corewatchd::server::DaemonServer;
use corewatchd::services::{platform_proxy_toggle, DaemonServices};
use corewatchd::store::{JsonFileStore, StateStore};

/// corewatch daemon - proxy core supervisor and connection monitor
#[derive(Parser, Debug)]
#[command(name = "corewatchd", version, about)]
struct Args {
    /// Path to the daemon configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon
    Start {
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,
    },
    /// Stop the running daemon
    Stop,
    /// Show daemon status
    Status,
}

fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("corewatch")
}

fn pid_file_path() -> PathBuf {
    state_dir().join("corewatchd.pid")
}

fn log_file_path() -> PathBuf {
    state_dir().join("corewatchd.log")
}

fn read_pid() -> Option<u32> {
    fs::read_to_string(pid_file_path()).ok()?.trim().parse().ok()
}

fn write_pid() -> Result<()> {
    let path = pid_file_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create state directory")?;
    }
    let mut file = File::create(&path).context("Failed to create PID file")?;
    write!(file, "{}", process::id()).context("Failed to write PID")?;
    Ok(())
}

fn remove_pid_file() {
    let _ = fs::remove_file(pid_file_path());
}

fn is_process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        // Signal 0 only checks that the process exists.
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        PathBuf::from(format!("/proc/{pid}")).exists()
    }
}

fn is_daemon_running() -> Option<u32> {
    if let Some(pid) = read_pid() {
        if is_process_running(pid) {
            return Some(pid);
        }
        remove_pid_file();
    }
    None
}

fn stop_daemon(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        let result = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if result != 0 {
            bail!("Failed to send SIGTERM to process {pid}");
        }
    }
    #[cfg(not(unix))]
    {
        bail!("Stop command is only supported on Unix systems");
    }
    Ok(())
}

fn load_config(explicit: Option<&Path>) -> Result<DaemonConfig> {
    DaemonConfig::load(explicit).context("Failed to load daemon configuration")
}

fn main() -> Result<()> {
    let args = Args::parse();

    let command = args.command.unwrap_or(Command::Start { daemon: false });

    match command {
        Command::Start { daemon } => {
            if let Some(pid) = is_daemon_running() {
                eprintln!("Daemon is already running (PID {pid})");
                eprintln!("Use 'corewatchd stop' to stop it first.");
                process::exit(1);
            }

            // Load before forking so configuration errors reach the terminal.
            let config = load_config(args.config.as_deref())?;

            if daemon {
                daemonize()?;
            }

            write_pid()?;

            let result = run_daemon(config);

            remove_pid_file();

            result
        }
        Command::Stop => {
            if let Some(pid) = is_daemon_running() {
                println!("Stopping daemon (PID {pid})...");
                stop_daemon(pid)?;

                // The daemon stops the core first, which may take a while.
                for _ in 0..150 {
                    if !is_process_running(pid) {
                        println!("Daemon stopped.");
                        return Ok(());
                    }
                    std::thread::sleep(std::time::Duration::from_millis(100));
                }

                eprintln!("Daemon did not stop within 15 seconds.");
                process::exit(1);
            } else {
                println!("Daemon is not running.");
                Ok(())
            }
        }
        Command::Status => {
            if let Some(pid) = is_daemon_running() {
                println!("Daemon is running (PID {pid})");

                let socket_path = load_config(args.config.as_deref())?.socket_path();
                if socket_path.exists() {
                    println!("Socket: {}", socket_path.display());
                }

                Ok(())
            } else {
                println!("Daemon is not running.");
                process::exit(1);
            }
        }
    }
}

fn daemonize() -> Result<()> {
    use daemonize::Daemonize;

    let log_path = log_file_path();

    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::create(&log_path).context("Failed to create log file for stdout")?;
    let stderr = stdout
        .try_clone()
        .context("Failed to create log file for stderr")?;

    let daemonize = Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr);

    daemonize.start().context("Failed to daemonize")?;

    Ok(())
}

#[tokio::main]
async fn run_daemon(config: DaemonConfig) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("corewatchd=info".parse()?)
                .add_directive("corewatch_core=info".parse()?)
                .add_directive("corewatch_protocol=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        development = config.is_development(),
        "corewatch daemon starting"
    );

    let socket_path = config.socket_path();
    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let store: Arc<dyn StateStore> = Arc::new(
        JsonFileStore::open(&config.state.path).context("Failed to open state store")?,
    );
    let proxy = platform_proxy_toggle(&config, store.clone());
    let services = DaemonServices::start(&config, store, proxy.clone(), cancel_token.clone());
    info!(binary = %config.core.binary.display(), family = %config.core.family, "Services started");

    match services.supervisor.restore_previous_session().await {
        Ok(Some(outcome)) => info!(pid = outcome.pid, port = outcome.port, "Previous session restored"),
        Ok(None) => {
            // Clears a system proxy a crashed daemon left pointing at its core.
            proxy.disable();
        }
        Err(e) => {
            warn!(error = %e, kind = e.kind(), "Failed to restore previous session");
            proxy.disable();
        }
    }
    services.register.mark_initialized();

    let server = DaemonServer::new(&socket_path, services.context(), cancel_token);

    info!(socket = %socket_path.display(), "Starting server");

    let served = server.run().await;

    // The core never outlives the daemon, so the system proxy is never
    // left pointing at a dead port. The pre-stop snapshot is persisted so
    // the next daemon start restores the session.
    let session = services.register.snapshot();
    if services.supervisor.is_running() {
        info!("Stopping core before exit");
        if let Err(e) = services.supervisor.stop().await {
            error!(error = %e, "Failed to stop core");
        }
    }
    if !services.register.save_state_with(session) {
        warn!("Failed to persist daemon state");
    }

    if let Err(e) = served {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("corewatch daemon stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
