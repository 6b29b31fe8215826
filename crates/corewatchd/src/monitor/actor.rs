//! Monitor actor: owns the log stream, the history and the group maps.
//!
//! Every start and stop request, stream report and timer expiry is a
//! [`MonitorCommand`] processed in order by [`MonitorActor::run`], so
//! transitions never interleave. Asynchronous paths carry a
//! [`ConnectionToken`] and are ignored once it is stale.
//!
//! # Panic-Free Guarantees
//!
//! No `.unwrap()` or `.expect()`. Reply send failures are ignored (the
//! caller may have given up).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use corewatch_core::{
    decode_entry, ConnectionGroups, ConnectionSnapshot, LogHistory, MonitorPhase, MonitoringState,
    StateEventKind, StateNotification, RECENT_LOGS_CAPACITY,
};
use corewatch_protocol::{PresentationEvent, RawLogRecord};

use super::backoff::BackoffPolicy;
use super::commands::{MonitorCommand, MonitorError, MonitorStatus};
use super::stream::{run_stream, ConnectionToken, StreamEndpoint, StreamError, StreamMessage};
use crate::config::MonitorSection;
use crate::events::EventBus;
use crate::extract::ConfigPortExtractor;
use crate::register::{RetryOutcome, StateRegister};

/// Tunables of the monitor.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorSettings {
    pub backoff: BackoffPolicy,
    pub preserve_secs: u64,
    pub idle_timeout: Duration,
}

impl MonitorSettings {
    pub fn from_config(section: &MonitorSection) -> Self {
        Self {
            backoff: BackoffPolicy::from_config(section),
            preserve_secs: section.preserve_secs,
            idle_timeout: Duration::from_secs(section.idle_timeout_secs.max(1)),
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self::from_config(&MonitorSection::default())
    }
}

struct ActiveStream {
    token: ConnectionToken,
    cancel: CancellationToken,
}

/// Collaborators of the actor.
pub struct MonitorContext {
    pub register: Arc<StateRegister>,
    pub extractor: Arc<dyn ConfigPortExtractor>,
    pub events: EventBus,
    pub client: reqwest::Client,
}

pub struct MonitorActor {
    receiver: mpsc::Receiver<MonitorCommand>,
    lifecycle: mpsc::UnboundedReceiver<MonitorCommand>,
    sender: mpsc::WeakSender<MonitorCommand>,
    shutdown: CancellationToken,
    settings: MonitorSettings,
    ctx: MonitorContext,

    endpoint: Option<StreamEndpoint>,
    phase: MonitorPhase,
    monitoring: MonitoringState,
    history: LogHistory,
    groups: ConnectionGroups,
    stream: Option<ActiveStream>,
    last_stream: ConnectionToken,
    /// Guards timers; bumped on every start and stop.
    epoch: ConnectionToken,
    /// Set when closing was requested; a failing teardown is not an error.
    graceful: bool,
    last_error: Option<String>,
}

impl MonitorActor {
    pub fn new(
        receiver: mpsc::Receiver<MonitorCommand>,
        lifecycle: mpsc::UnboundedReceiver<MonitorCommand>,
        sender: mpsc::WeakSender<MonitorCommand>,
        shutdown: CancellationToken,
        settings: MonitorSettings,
        ctx: MonitorContext,
    ) -> Self {
        let monitoring = MonitoringState::with_preserve_secs(settings.preserve_secs);
        let mut actor = Self {
            receiver,
            lifecycle,
            sender,
            shutdown,
            settings,
            ctx,
            endpoint: None,
            phase: MonitorPhase::Idle,
            monitoring,
            history: LogHistory::new(),
            groups: ConnectionGroups::new(),
            stream: None,
            last_stream: ConnectionToken::default(),
            epoch: ConnectionToken::default(),
            graceful: false,
            last_error: None,
        };
        let config_path = actor.ctx.register.snapshot().config_path;
        actor.refresh_endpoint(config_path.as_deref());
        actor
    }

    /// Runs the actor loop until shutdown or until every sender is gone.
    pub async fn run(mut self) {
        info!("Connection monitor started");

        loop {
            let cmd = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                Some(cmd) = self.lifecycle.recv() => cmd,
                cmd = self.receiver.recv() => match cmd {
                    Some(cmd) => cmd,
                    None => break,
                },
            };
            self.handle_command(cmd);
        }

        self.close_stream();
        info!("Connection monitor stopped");
    }

    fn handle_command(&mut self, cmd: MonitorCommand) {
        match cmd {
            MonitorCommand::Start { respond_to } => {
                let result = self.begin(true).map(|_| self.status());
                let _ = respond_to.send(result);
            }
            MonitorCommand::Stop { respond_to } => {
                self.stop_requested();
                let _ = respond_to.send(self.status());
            }
            MonitorCommand::ClearHistory { respond_to } => {
                self.reset_view();
                let _ = respond_to.send(());
            }
            MonitorCommand::Snapshot { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }
            MonitorCommand::Lifecycle(notification) => self.handle_lifecycle(&notification),
            MonitorCommand::Stream(message) => self.handle_stream(message),
            MonitorCommand::Reconnect { token } => self.handle_reconnect(token),
            MonitorCommand::PreserveExpired { token } => self.handle_preserve_expired(token),
        }
    }

    fn status(&self) -> MonitorStatus {
        MonitorStatus {
            phase: self.phase,
            monitoring: self.monitoring.clone(),
        }
    }

    fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            phase: self.phase,
            monitoring: self.monitoring.clone(),
            groups: self.groups.snapshot(),
            history_len: self.history.len(),
            recent: self.history.recent(RECENT_LOGS_CAPACITY),
        }
    }

    // ========================================================================
    // Start / stop
    // ========================================================================

    /// Starts or resumes monitoring. `explicit` requests also enable the
    /// monitor in the state register, which clears its retry history.
    fn begin(&mut self, explicit: bool) -> Result<(), MonitorError> {
        if !self.ctx.register.snapshot().is_running {
            return Err(MonitorError::CoreNotRunning);
        }

        let active = self.stream.is_some() || self.phase == MonitorPhase::Backoff;
        if self.monitoring.is_monitoring && active {
            debug!(phase = %self.phase, "Monitoring already active");
            return Ok(());
        }

        let now = Utc::now();
        let resumed = self.monitoring.is_preserving(now);
        let request = self.monitoring.next_request();
        self.epoch = self.epoch.next();
        self.monitoring.is_monitoring = true;
        self.monitoring.clear_preserve();
        self.monitoring.last_start_time = Some(now);
        self.graceful = false;
        self.reset_view();

        if explicit {
            self.ctx.register.enable_connection_monitor();
        }

        if resumed && self.stream.is_some() {
            info!(request, "Resuming preserved log stream");
            self.monitoring.pending_start = false;
        } else {
            info!(request, resumed, "Starting connection monitoring");
            self.close_stream();
            self.monitoring.pending_start = true;
            self.open_stream();
        }

        self.ctx
            .events
            .publish(PresentationEvent::ConnectionMonitoringStarted { resumed });
        Ok(())
    }

    /// Explicit stop: delivery pauses, the open stream survives the
    /// preserve window.
    fn stop_requested(&mut self) {
        if !self.monitoring.is_monitoring {
            debug!("Monitoring already stopped");
            return;
        }

        self.epoch = self.epoch.next();
        self.monitoring.is_monitoring = false;
        self.monitoring.pending_start = false;
        self.graceful = true;

        let preserve_until = if self.stream.is_some() {
            let until = self.monitoring.arm_preserve(Utc::now());
            self.schedule(
                Duration::from_secs(self.monitoring.preserve_duration_secs),
                MonitorCommand::PreserveExpired { token: self.epoch },
            );
            Some(until)
        } else {
            self.monitoring.clear_preserve();
            self.phase = MonitorPhase::ClosedGraceful;
            None
        };

        info!(?preserve_until, "Connection monitoring stopped");
        self.ctx.register.disable_connection_monitor();
        self.ctx
            .events
            .publish(PresentationEvent::ConnectionMonitoringStopped { preserve_until });
    }

    /// Lifecycle stop: the stream is destroyed at once.
    fn stop_for_core(&mut self) {
        let was_monitoring = self.monitoring.is_monitoring;
        self.epoch = self.epoch.next();
        self.graceful = true;
        self.close_stream();
        self.monitoring.is_monitoring = false;
        self.monitoring.pending_start = false;

        if !was_monitoring {
            // core-stopped follows core-stopping; keep the window the
            // first one armed.
            if !self.monitoring.is_preserving(Utc::now()) {
                self.monitoring.clear_preserve();
            }
            if self.phase != MonitorPhase::Disabled {
                self.phase = MonitorPhase::ClosedGraceful;
            }
            return;
        }

        let until = self.monitoring.arm_preserve(Utc::now());
        self.phase = MonitorPhase::ClosedGraceful;
        info!(%until, "Core stopping, log stream closed");
        self.ctx
            .events
            .publish(PresentationEvent::ConnectionMonitoringStopped {
                preserve_until: Some(until),
            });
    }

    fn reset_view(&mut self) {
        self.history.clear();
        self.groups.clear();
        self.ctx.events.publish(PresentationEvent::ConnectionLogReset);
    }

    // ========================================================================
    // Lifecycle notifications
    // ========================================================================

    fn handle_lifecycle(&mut self, notification: &StateNotification) {
        match notification.kind {
            StateEventKind::CoreStarted => {
                self.ctx.register.reset_connection_monitor();
                self.refresh_endpoint(notification.new_state.config_path.as_deref());
                debug!(endpoint = ?self.endpoint, "Core started, monitor endpoint refreshed");
            }
            StateEventKind::CoreStopping | StateEventKind::CoreStopped => self.stop_for_core(),
            StateEventKind::ConnectionMonitorEnabled => {
                // Echo of an enable that was since revoked.
                if !self.ctx.register.snapshot().connection_monitor.enabled {
                    return;
                }
                if let Err(e) = self.begin(false) {
                    debug!(error = %e, "Ignoring monitor enable");
                }
            }
            StateEventKind::ConnectionMonitorDisabled => {
                if self.monitoring.is_monitoring {
                    self.stop_requested();
                }
            }
            StateEventKind::MaxRetries => {
                let retries = notification.new_state.connection_monitor.retry_count;
                let reason = self
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "retry ceiling reached".to_string());
                error!(kind = "retry-ceiling-reached", retries, %reason, "Connection monitoring disabled");
                self.epoch = self.epoch.next();
                self.close_stream();
                self.monitoring.is_monitoring = false;
                self.monitoring.pending_start = false;
                self.phase = MonitorPhase::Disabled;
                self.ctx
                    .events
                    .publish(PresentationEvent::ConnectionMonitoringFailed { retries, reason });
            }
            _ => {}
        }
    }

    fn refresh_endpoint(&mut self, config_path: Option<&std::path::Path>) {
        self.endpoint = config_path
            .and_then(|path| self.ctx.extractor.parse(path))
            .and_then(|config| StreamEndpoint::from_extracted(&config));
    }

    // ========================================================================
    // Stream
    // ========================================================================

    fn open_stream(&mut self) {
        self.phase = MonitorPhase::Connecting;

        let Some(endpoint) = self.endpoint.clone() else {
            self.handle_failure(StreamError::ApiUnreachable(
                "no diagnostic API address in the core configuration".to_string(),
            ));
            return;
        };
        let Some(sink) = self.sender.upgrade() else {
            return;
        };

        self.last_stream = self.last_stream.next();
        let token = self.last_stream;
        let cancel = self.shutdown.child_token();
        tokio::spawn(run_stream(
            self.ctx.client.clone(),
            endpoint,
            token,
            self.settings.idle_timeout,
            cancel.clone(),
            sink,
        ));
        self.stream = Some(ActiveStream { token, cancel });
    }

    fn close_stream(&mut self) {
        if let Some(stream) = self.stream.take() {
            debug!(token = %stream.token, "Closing log stream");
            stream.cancel.cancel();
        }
    }

    fn is_current(&self, token: ConnectionToken) -> bool {
        self.stream.as_ref().map(|s| s.token) == Some(token)
    }

    fn handle_stream(&mut self, message: StreamMessage) {
        match message {
            StreamMessage::Opened { token } => {
                if !self.is_current(token) {
                    return;
                }
                debug!(%token, "Log stream open");
                self.phase = MonitorPhase::Streaming;
                self.monitoring.pending_start = false;
                self.last_error = None;
                self.ctx.register.reset_connection_monitor();
            }
            StreamMessage::Record { token, record } => {
                if self.is_current(token) && self.monitoring.is_monitoring {
                    self.record(record);
                }
            }
            StreamMessage::Closed { token, result } => {
                if !self.is_current(token) {
                    return;
                }
                self.stream = None;
                match result {
                    _ if self.graceful || !self.monitoring.is_monitoring => {
                        if self.phase != MonitorPhase::Disabled {
                            self.phase = MonitorPhase::ClosedGraceful;
                        }
                    }
                    Ok(()) => self.handle_failure(StreamError::StreamInterrupted(
                        "stream cancelled".to_string(),
                    )),
                    Err(e) => self.handle_failure(e),
                }
            }
        }
    }

    fn record(&mut self, record: RawLogRecord) {
        let entry = decode_entry(&record.log_type, &record.payload, Utc::now());
        self.groups.record(&entry);
        self.history.push(entry.clone());
        self.ctx.events.publish(PresentationEvent::ConnectionLog {
            entry: Box::new(entry),
        });
        self.ctx.events.publish(PresentationEvent::ConnectionGroups {
            groups: self.groups.snapshot(),
        });
    }

    fn handle_failure(&mut self, error: StreamError) {
        self.phase = MonitorPhase::ClosedError;
        self.last_error = Some(error.to_string());

        match self.ctx.register.record_connection_retry() {
            RetryOutcome::Recorded { retry_count } => {
                let delay = self.settings.backoff.delay(retry_count);
                warn!(kind = error.kind(), %error, retry_count, ?delay, "Log stream failed, backing off");
                self.phase = MonitorPhase::Backoff;
                self.schedule(delay, MonitorCommand::Reconnect { token: self.epoch });
            }
            RetryOutcome::CeilingReached { .. } | RetryOutcome::Exhausted => {
                self.phase = MonitorPhase::Disabled;
                self.monitoring.is_monitoring = false;
                self.monitoring.pending_start = false;
            }
        }
    }

    fn handle_reconnect(&mut self, token: ConnectionToken) {
        let enabled = self.ctx.register.snapshot().connection_monitor.enabled;
        if token != self.epoch
            || self.phase != MonitorPhase::Backoff
            || !self.monitoring.is_monitoring
            || !enabled
        {
            debug!(%token, "Ignoring stale reconnect");
            return;
        }
        debug!(%token, "Reconnecting log stream");
        self.open_stream();
    }

    fn handle_preserve_expired(&mut self, token: ConnectionToken) {
        if token != self.epoch || self.monitoring.is_monitoring {
            return;
        }
        debug!("Preserve window elapsed");
        self.monitoring.clear_preserve();
        self.close_stream();
        if self.phase != MonitorPhase::Disabled {
            self.phase = MonitorPhase::ClosedGraceful;
        }
    }

    /// Delivers `cmd` to this actor after `delay`.
    fn schedule(&self, delay: Duration, cmd: MonitorCommand) {
        let sender = self.sender.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Some(sender) = sender.upgrade() {
                        let _ = sender.send(cmd).await;
                    }
                }
            }
        });
    }
}
