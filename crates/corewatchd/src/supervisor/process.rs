//! Child process plumbing: output readers, termination and the exit watcher.
//!
//! # Panic-Free Guarantees
//!
//! Channel send failures are ignored (the receiver may be gone); poisoned
//! locks are recovered with `into_inner()`.

use std::collections::VecDeque;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use corewatch_core::ExitReport;
use corewatch_protocol::{OutputStream, PresentationEvent};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::events::EventBus;

/// Number of stderr lines kept for crash reports.
pub const STDERR_TAIL_LINES: usize = 20;

/// How long to wait for readers to drain after the process exits.
const READER_DRAIN: Duration = Duration::from_millis(250);

/// Shared ring buffer of the most recent stderr lines.
pub type OutputTail = Arc<Mutex<VecDeque<String>>>;

/// Forwards each line of a child pipe to the log and the event bus.
pub fn spawn_output_reader<R>(
    pipe: R,
    stream: OutputStream,
    pid: u32,
    events: EventBus,
    tail: Option<OutputTail>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    match stream {
                        OutputStream::Stdout => info!(target: "corewatchd::core", pid, "{line}"),
                        OutputStream::Stderr => warn!(target: "corewatchd::core", pid, "{line}"),
                    }
                    if let Some(tail) = &tail {
                        let mut tail = tail.lock().unwrap_or_else(|e| e.into_inner());
                        if tail.len() >= STDERR_TAIL_LINES {
                            tail.pop_front();
                        }
                        tail.push_back(line.clone());
                    }
                    events.publish(PresentationEvent::CoreOutput { stream, line });
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(pid, ?stream, error = %e, "Core output not readable");
                    break;
                }
            }
        }
    })
}

/// Sends SIGTERM. Returns false if the signal could not be delivered.
#[cfg(unix)]
pub fn terminate_gracefully(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: kill(2) has no memory-safety preconditions.
    unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
pub fn terminate_gracefully(_pid: u32) -> bool {
    false
}

/// Asks the child to exit, then kills it once `grace` elapses.
pub async fn terminate(child: &mut Child, pid: u32, grace: Duration) -> std::io::Result<ExitStatus> {
    if terminate_gracefully(pid) {
        match timeout(grace, child.wait()).await {
            Ok(result) => return result,
            Err(_) => warn!(pid, ?grace, "Core ignored SIGTERM, killing"),
        }
    }
    child.start_kill()?;
    child.wait().await
}

#[cfg(unix)]
fn signal_of(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn signal_of(_status: &ExitStatus) -> Option<i32> {
    None
}

/// Builds the report handed to exit listeners.
pub fn exit_report(
    pid: u32,
    result: std::io::Result<ExitStatus>,
    requested: bool,
    tail: &OutputTail,
) -> ExitReport {
    let mut report = match result {
        Ok(status) => ExitReport {
            pid,
            code: status.code(),
            signal: signal_of(&status),
            requested,
            error: None,
        },
        Err(e) => ExitReport {
            pid,
            code: None,
            signal: None,
            requested,
            error: Some(format!("failed to wait for core: {e}")),
        },
    };

    if report.error.is_none() && report.is_crash() {
        let lines: Vec<String> = tail
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect();
        report.error = Some(if lines.is_empty() {
            match (report.code, report.signal) {
                (Some(code), _) => format!("core exited with code {code}"),
                (None, Some(signal)) => format!("core terminated by signal {signal}"),
                (None, None) => "core exited".to_string(),
            }
        } else {
            lines.join("\n")
        });
    }
    report
}

/// Waits for the child to exit, or for a kill request.
///
/// Returns the exit result and whether the exit was requested. A dropped
/// kill sender counts as a request.
pub async fn wait_for_exit(
    child: &mut Child,
    pid: u32,
    kill_rx: oneshot::Receiver<()>,
    grace: Duration,
) -> (std::io::Result<ExitStatus>, bool) {
    tokio::select! {
        result = child.wait() => (result, false),
        _ = kill_rx => (terminate(child, pid, grace).await, true),
    }
}

/// Gives output readers a moment to reach EOF so the tail is complete.
pub async fn drain_readers(readers: Vec<JoinHandle<()>>) {
    for reader in readers {
        let _ = timeout(READER_DRAIN, reader).await;
    }
}
