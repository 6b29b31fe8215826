//! Daemon management for the corewatch CLI.
//!
//! Checks whether `corewatchd` is running and starts it in the background
//! when a command needs it.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info};

/// How long to wait for a freshly spawned daemon to open its socket.
const STARTUP_WAIT: Duration = Duration::from_secs(3);
const STARTUP_POLL: Duration = Duration::from_millis(100);

/// Returns the path to the daemon PID file.
pub fn pid_file_path() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("corewatch")
        .join("corewatchd.pid")
}

/// Reads the PID from the PID file, if it exists.
fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Checks if a process with the given PID is running.
fn is_process_running(pid: u32) -> bool {
    PathBuf::from(format!("/proc/{pid}")).exists()
}

/// Checks if the daemon is currently running according to its pid file.
pub fn is_daemon_running() -> bool {
    read_pid(&pid_file_path()).is_some_and(is_process_running)
}

/// Locates `corewatchd`, preferring the directory of the running binary.
fn daemon_binary() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|d| d.join("corewatchd")))
        .filter(|p| p.exists())
        .unwrap_or_else(|| PathBuf::from("corewatchd"))
}

/// Spawns `corewatchd start -d` as a detached process.
fn spawn_daemon(config: Option<&Path>) -> std::io::Result<()> {
    let path = daemon_binary();
    debug!(path = %path.display(), "Starting daemon");

    let mut command = Command::new(&path);
    if let Some(config) = config {
        command.arg("--config").arg(config);
    }
    command
        .args(["start", "-d"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    Ok(())
}

/// Ensures the daemon is running and listening on `socket_path`, starting
/// it if necessary.
pub async fn ensure_daemon_running(socket_path: &Path, config: Option<&Path>) -> Result<(), String> {
    if socket_path.exists() && is_daemon_running() {
        debug!("Daemon already running");
        return Ok(());
    }

    info!("Daemon not running, starting it");
    spawn_daemon(config).map_err(|e| format!("Failed to start daemon: {e}"))?;

    let attempts = STARTUP_WAIT.as_millis() / STARTUP_POLL.as_millis();
    for i in 0..attempts {
        sleep(STARTUP_POLL).await;
        if socket_path.exists() {
            info!(attempts = i + 1, "Daemon started");
            return Ok(());
        }
    }

    Err(format!(
        "Daemon failed to start within {} seconds",
        STARTUP_WAIT.as_secs()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_file_path() {
        let path = pid_file_path();
        assert!(path.ends_with("corewatch/corewatchd.pid"));
    }

    #[test]
    fn test_read_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corewatchd.pid");
        assert_eq!(read_pid(&path), None);

        fs::write(&path, "4242\n").unwrap();
        assert_eq!(read_pid(&path), Some(4242));

        fs::write(&path, "garbage").unwrap();
        assert_eq!(read_pid(&path), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_is_process_running_current() {
        assert!(is_process_running(std::process::id()));
    }

    #[test]
    fn test_is_process_running_nonexistent() {
        assert!(!is_process_running(999_999_999));
    }
}
