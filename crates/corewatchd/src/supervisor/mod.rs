//! Core process supervisor.
//!
//! Owns at most one proxy core child process. `start`, `stop` and `restart`
//! are serialized by an async operation lock; exits are observed by a
//! watcher task per spawned process, tagged with a generation number so an
//! exit of a replaced process never clobbers the state of its successor.
//!
//! Lifecycle transitions are written to the [`StateRegister`]; the
//! presentation layer and the connection monitor learn about them from its
//! notifications.
//!
//! # Panic-Free Guarantees
//!
//! Poisoned locks are recovered with `into_inner()`. Channel send failures
//! are ignored (the receiver may be gone).

mod error;
mod process;
mod status;

pub use error::SupervisorError;
pub use process::STDERR_TAIL_LINES;
pub use status::scan_core_processes;

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use corewatch_core::{
    apply_settings, default_mappings, CoreFamily, CoreStatus, ExitReport, GlobalStatePatch,
    ProxyRuntimeConfig, StateEventKind,
};
use corewatch_protocol::{OutputStream, PresentationEvent};
use serde_json::Value;
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::DaemonConfig;
use crate::events::EventBus;
use crate::extract::ConfigPortExtractor;
use crate::proxy::ProxyToggle;
use crate::register::StateRegister;
use process::OutputTail;

/// Time allowed for a stop before it is reported as failed.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Time between SIGTERM and SIGKILL.
pub const DEFAULT_TERM_GRACE: Duration = Duration::from_secs(5);

/// Static supervisor settings.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub binary: PathBuf,
    pub family: CoreFamily,
    pub work_dir: PathBuf,
    /// Used when a start request names no configuration.
    pub default_config: Option<PathBuf>,
    /// Pause between stop and start during a restart.
    pub settle_delay: Duration,
    pub stop_timeout: Duration,
    pub term_grace: Duration,
}

impl SupervisorSettings {
    pub fn from_config(config: &DaemonConfig) -> Self {
        Self {
            binary: config.core.binary.clone(),
            family: config.core.family,
            work_dir: config.core.work_dir.clone(),
            default_config: config.core.config.clone(),
            settle_delay: config.settle_delay(),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            term_grace: DEFAULT_TERM_GRACE,
        }
    }
}

/// Called once with the exit report of the process a start spawned.
pub type ExitCallback = Box<dyn FnOnce(ExitReport) + Send>;

/// Parameters of a start.
#[derive(Default)]
pub struct StartRequest {
    pub config_path: Option<PathBuf>,
    /// Presentation-layer settings, translated through the field mappings.
    pub overrides: HashMap<String, Value>,
    pub on_exit: Option<ExitCallback>,
}

impl StartRequest {
    pub fn new(config_path: Option<PathBuf>) -> Self {
        Self {
            config_path,
            ..Self::default()
        }
    }

    pub fn with_overrides(mut self, overrides: HashMap<String, Value>) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn on_exit(mut self, callback: impl FnOnce(ExitReport) + Send + 'static) -> Self {
        self.on_exit = Some(Box::new(callback));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOutcome {
    pub pid: u32,
    pub port: u16,
    pub config_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopOutcome {
    pub message: String,
}

struct ProcessHandle {
    pid: u32,
    config_path: PathBuf,
    started_at: DateTime<Utc>,
    generation: u64,
    kill_tx: Option<oneshot::Sender<()>>,
    done_rx: Option<oneshot::Receiver<ExitReport>>,
}

struct Inner {
    settings: SupervisorSettings,
    runtime: Mutex<ProxyRuntimeConfig>,
    ops: tokio::sync::Mutex<()>,
    handle: Mutex<Option<ProcessHandle>>,
    stopping: AtomicBool,
    generation: AtomicU64,
    register: Arc<StateRegister>,
    proxy: Arc<dyn ProxyToggle>,
    extractor: Arc<dyn ConfigPortExtractor>,
    events: EventBus,
}

/// Resets the stopping flag when a stop finishes, however it finishes.
struct StoppingGuard<'a>(&'a AtomicBool);

impl Drop for StoppingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Cheap-to-clone supervisor handle.
#[derive(Clone)]
pub struct CoreSupervisor {
    inner: Arc<Inner>,
}

impl CoreSupervisor {
    pub fn new(
        settings: SupervisorSettings,
        runtime: ProxyRuntimeConfig,
        register: Arc<StateRegister>,
        proxy: Arc<dyn ProxyToggle>,
        extractor: Arc<dyn ConfigPortExtractor>,
        events: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                runtime: Mutex::new(runtime),
                ops: tokio::sync::Mutex::new(()),
                handle: Mutex::new(None),
                stopping: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                register,
                proxy,
                extractor,
                events,
            }),
        }
    }

    fn lock_handle(&self) -> MutexGuard<'_, Option<ProcessHandle>> {
        self.inner.handle.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.inner.settings
    }

    /// Runtime config of the current (or last) run.
    pub fn runtime(&self) -> ProxyRuntimeConfig {
        self.inner
            .runtime
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn current_pid(&self) -> Option<u32> {
        self.lock_handle().as_ref().map(|h| h.pid)
    }

    pub fn is_running(&self) -> bool {
        self.lock_handle().is_some()
    }

    /// Start time of the tracked process.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.lock_handle().as_ref().map(|h| h.started_at)
    }

    // ========================================================================
    // Start
    // ========================================================================

    /// Starts the core. A running core is stopped first.
    pub async fn start(&self, request: StartRequest) -> Result<StartOutcome, SupervisorError> {
        let _ops = self.inner.ops.lock().await;
        self.start_locked(request).await
    }

    async fn start_locked(&self, request: StartRequest) -> Result<StartOutcome, SupervisorError> {
        let settings = &self.inner.settings;

        let config_path = request
            .config_path
            .or_else(|| settings.default_config.clone())
            .ok_or(SupervisorError::NoConfig)?;
        if !settings.binary.is_file() {
            return Err(SupervisorError::NotInstalled(settings.binary.clone()));
        }
        if !config_path.is_file() {
            return Err(SupervisorError::ConfigMissing(config_path));
        }

        let mut runtime = self.runtime();
        match self.inner.extractor.parse(&config_path) {
            Some(extracted) => runtime.port = extracted.port,
            None => debug!(
                config = %config_path.display(),
                port = runtime.port,
                "No port in core config, keeping current"
            ),
        }
        apply_settings(&mut runtime, &request.overrides, &default_mappings())?;

        if self.is_running() {
            info!("Core already running, stopping it first");
            if let Err(e) = self.stop_locked().await {
                warn!(error = %e, "Failed to stop previous core");
            }
        }

        if let Err(e) = tokio::fs::create_dir_all(&settings.work_dir).await {
            warn!(dir = %settings.work_dir.display(), error = %e, "Failed to create work dir");
        }

        let args = settings.family.args(&config_path, &settings.work_dir);
        info!(
            binary = %settings.binary.display(),
            family = %settings.family,
            ?args,
            "Spawning core"
        );
        let mut child = Command::new(&settings.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SupervisorError::SpawnFailed {
                binary: settings.binary.clone(),
                source,
            })?;
        let pid = child.id().unwrap_or(0);

        let tail = OutputTail::default();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(process::spawn_output_reader(
                stdout,
                OutputStream::Stdout,
                pid,
                self.inner.events.clone(),
                None,
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(process::spawn_output_reader(
                stderr,
                OutputStream::Stderr,
                pid,
                self.inner.events.clone(),
                Some(tail.clone()),
            ));
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (kill_tx, kill_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        // Holds the watcher back until start has published `running`.
        let (started_tx, started_rx) = oneshot::channel::<()>();

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let grace = settings.term_grace;
        let on_exit = request.on_exit;
        tokio::spawn(async move {
            let (result, requested) = process::wait_for_exit(&mut child, pid, kill_rx, grace).await;
            let _ = started_rx.await;
            process::drain_readers(readers).await;

            let report = process::exit_report(pid, result, requested, &tail);
            if let Some(inner) = weak.upgrade() {
                CoreSupervisor { inner }.handle_exit(generation, &report);
            }
            if let Some(on_exit) = on_exit {
                on_exit(report.clone());
            }
            let _ = done_tx.send(report);
        });

        let started_at = Utc::now();
        *self.lock_handle() = Some(ProcessHandle {
            pid,
            config_path: config_path.clone(),
            started_at,
            generation,
            kill_tx: Some(kill_tx),
            done_rx: Some(done_rx),
        });
        *self.inner.runtime.lock().unwrap_or_else(|e| e.into_inner()) = runtime.clone();

        if runtime.enable_system_proxy
            && !self
                .inner
                .proxy
                .enable(runtime.system_proxy_host(), runtime.port)
        {
            warn!(port = runtime.port, "Failed to enable system proxy");
        }

        self.inner.register.update_with(
            StateEventKind::CoreStarted,
            GlobalStatePatch::none()
                .running(true)
                .start_time(Some(started_at))
                .config_path(Some(config_path.clone()))
                .last_error(None),
        );
        self.inner.register.save_state();
        let _ = started_tx.send(());

        info!(pid, port = runtime.port, generation, "Core started");
        Ok(StartOutcome {
            pid,
            port: runtime.port,
            config_path,
        })
    }

    /// Bookkeeping after a process exits. Runs on the watcher task.
    fn handle_exit(&self, generation: u64, report: &ExitReport) {
        let current = {
            let mut handle = self.lock_handle();
            match handle.as_ref() {
                Some(h) if h.generation == generation => {
                    *handle = None;
                    true
                }
                _ => false,
            }
        };

        if report.is_crash() {
            error!(
                kind = "process-crash",
                pid = report.pid,
                code = ?report.code,
                signal = ?report.signal,
                error = report.error.as_deref().unwrap_or(""),
                "Core exited unexpectedly"
            );
        } else {
            info!(pid = report.pid, code = ?report.code, requested = report.requested, "Core exited");
        }

        if current {
            self.inner.proxy.disable();
            let error = if report.is_crash() {
                report.error.clone()
            } else {
                None
            };
            self.mark_stopped(error);
        } else {
            debug!(generation, "Exit of a replaced core, state untouched");
        }

        self.inner
            .events
            .publish(PresentationEvent::CoreExited(report.clone()));
    }

    fn mark_stopped(&self, error: Option<String>) {
        let mut patch = GlobalStatePatch::none().running(false).start_time(None);
        if error.is_some() {
            patch = patch.last_error(error);
        }
        self.inner
            .register
            .update_with(StateEventKind::CoreStopped, patch);
        self.inner.register.save_state();
    }

    // ========================================================================
    // Stop
    // ========================================================================

    /// Stops the core. Stopping an idle supervisor succeeds.
    pub async fn stop(&self) -> Result<StopOutcome, SupervisorError> {
        if self.inner.stopping.swap(true, Ordering::SeqCst) {
            return Err(SupervisorError::AlreadyStopping);
        }
        let _guard = StoppingGuard(&self.inner.stopping);
        let _ops = self.inner.ops.lock().await;
        self.stop_locked().await
    }

    async fn stop_locked(&self) -> Result<StopOutcome, SupervisorError> {
        let taken = self
            .lock_handle()
            .as_mut()
            .map(|h| (h.pid, h.generation, h.kill_tx.take(), h.done_rx.take()));

        let Some((pid, generation, kill_tx, done_rx)) = taken else {
            self.inner.proxy.disable();
            self.inner.register.update_with(
                StateEventKind::CoreStopped,
                GlobalStatePatch::none().running(false).start_time(None),
            );
            self.inner.register.save_state();
            return Ok(StopOutcome {
                message: "Core was not running".to_string(),
            });
        };

        info!(pid, "Stopping core");
        self.inner.register.notify(StateEventKind::CoreStopping);
        self.inner.proxy.disable();

        // Persist "not running" before the kill so a daemon crash mid-stop
        // does not resurrect the core on the next launch.
        let mut snapshot = self.inner.register.snapshot();
        snapshot.is_running = false;
        snapshot.start_time = None;
        self.inner.register.save_state_with(snapshot);

        if let Some(kill_tx) = kill_tx {
            let _ = kill_tx.send(());
        }

        let Some(mut done_rx) = done_rx else {
            warn!(pid, "Core watcher already detached");
            self.clear_handle(generation);
            self.mark_stopped(None);
            return Ok(StopOutcome {
                message: format!("Core stopped (pid {pid})"),
            });
        };

        let stop_timeout = self.inner.settings.stop_timeout;
        match timeout(stop_timeout, &mut done_rx).await {
            Ok(Ok(report)) => Ok(StopOutcome {
                message: match report.code {
                    Some(code) => format!("Core stopped (pid {pid}, code {code})"),
                    None => format!("Core stopped (pid {pid})"),
                },
            }),
            Ok(Err(_)) => {
                warn!(pid, "Core watcher vanished during stop");
                if self.clear_handle(generation) {
                    self.mark_stopped(None);
                }
                Ok(StopOutcome {
                    message: format!("Core stopped (pid {pid})"),
                })
            }
            Err(_) => {
                error!(pid, ?stop_timeout, "Core did not exit in time");
                if let Some(h) = self.lock_handle().as_mut() {
                    if h.generation == generation {
                        h.done_rx = Some(done_rx);
                    }
                }
                Err(SupervisorError::StopFailed {
                    pid,
                    timeout: stop_timeout,
                })
            }
        }
    }

    fn clear_handle(&self, generation: u64) -> bool {
        let mut handle = self.lock_handle();
        if handle.as_ref().map(|h| h.generation) == Some(generation) {
            *handle = None;
            true
        } else {
            false
        }
    }

    // ========================================================================
    // Restart / status / restore
    // ========================================================================

    /// Stops the core, waits the settle delay, then starts it with the
    /// previous configuration. A failed stop aborts the restart.
    pub async fn restart(&self) -> Result<StartOutcome, SupervisorError> {
        let _ops = self.inner.ops.lock().await;

        let previous = self
            .lock_handle()
            .as_ref()
            .map(|h| h.config_path.clone())
            .or_else(|| self.inner.register.snapshot().config_path);

        self.stop_locked().await?;
        tokio::time::sleep(self.inner.settings.settle_delay).await;
        self.start_locked(StartRequest::new(previous)).await
    }

    /// Scans the process table for the core binary.
    pub async fn get_status(&self) -> CoreStatus {
        let binary = self.inner.settings.binary.clone();
        let tracked = self.current_pid();
        match tokio::task::spawn_blocking(move || scan_core_processes(&binary, tracked)).await {
            Ok(status) => status,
            Err(e) => {
                warn!(error = %e, "Process scan failed");
                CoreStatus::from_pids(tracked.into_iter().collect())
            }
        }
    }

    /// Starts the core again if it was running when the daemon last exited.
    pub async fn restore_previous_session(&self) -> Result<Option<StartOutcome>, SupervisorError> {
        let Some(persisted) = self.inner.register.load_state() else {
            return Ok(None);
        };
        if !persisted.state.is_running {
            debug!("Core was not running in the previous session");
            return Ok(None);
        }

        info!(
            config = ?persisted.state.config_path,
            saved_at = %persisted.saved_at,
            "Restoring core from previous session"
        );
        self.start(StartRequest::new(persisted.state.config_path))
            .await
            .map(Some)
    }
}
