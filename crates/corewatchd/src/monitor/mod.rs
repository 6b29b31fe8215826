//! Live connection-log monitor.
//!
//! Streams the core's diagnostic `/logs` endpoint, decodes each record into
//! a connection entry, and keeps a bounded history plus four group maps.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────┐  MonitorBridge   ┌──────────────┐  EventBus   ┌─────────┐
//! │ StateRegister  │─────────────────▶│ MonitorActor │────────────▶│ clients │
//! └────────────────┘  (unbounded)     └──────────────┘             └─────────┘
//!                                       ▲          │ spawns
//!                MonitorHandle ─────────┤          ▼
//!                (mpsc + oneshot)       └──── run_stream (reqwest)
//! ```
//!
//! The monitor never calls the supervisor. It learns about core lifecycle
//! from state register notifications, forwarded by [`MonitorBridge`].

mod actor;
mod backoff;
mod codec;
mod commands;
mod handle;
mod stream;

pub use actor::{MonitorActor, MonitorContext, MonitorSettings};
pub use backoff::BackoffPolicy;
pub use codec::{LogLineCodec, MAX_LINE_LENGTH};
pub use commands::{MonitorCommand, MonitorError, MonitorStatus};
pub use handle::MonitorHandle;
pub use stream::{ConnectionToken, StreamEndpoint, StreamError, StreamMessage};

use std::sync::Arc;

use corewatch_core::{StateEventKind, StateNotification};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::register::{ListenerError, SharedListener, StateListener};

/// Command channel buffer size
const COMMAND_BUFFER: usize = 256;

/// Forwards the register notifications the monitor reacts to.
pub struct MonitorBridge {
    sender: mpsc::UnboundedSender<MonitorCommand>,
}

impl MonitorBridge {
    fn forwards(kind: StateEventKind) -> bool {
        matches!(
            kind,
            StateEventKind::CoreStarted
                | StateEventKind::CoreStopping
                | StateEventKind::CoreStopped
                | StateEventKind::ConnectionMonitorEnabled
                | StateEventKind::ConnectionMonitorDisabled
                | StateEventKind::MaxRetries
        )
    }
}

impl StateListener for MonitorBridge {
    fn on_state_change(&self, notification: &StateNotification) -> Result<(), ListenerError> {
        if !Self::forwards(notification.kind) {
            return Ok(());
        }
        trace!(kind = notification.kind.as_str(), "Forwarding to monitor");
        self.sender
            .send(MonitorCommand::Lifecycle(Box::new(notification.clone())))
            .map_err(|_| ListenerError::new("connection monitor has shut down"))
    }
}

/// Spawns the monitor actor and registers its bridge with the register.
///
/// The actor exits when `shutdown` is cancelled or every handle is dropped.
pub fn spawn_monitor(
    settings: MonitorSettings,
    ctx: MonitorContext,
    shutdown: CancellationToken,
) -> MonitorHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();

    let bridge: SharedListener = Arc::new(MonitorBridge {
        sender: lifecycle_tx,
    });
    ctx.register.add_listener(bridge);

    let actor = MonitorActor::new(
        cmd_rx,
        lifecycle_rx,
        cmd_tx.downgrade(),
        shutdown,
        settings,
        ctx,
    );
    tokio::spawn(actor.run());

    MonitorHandle::new(cmd_tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::extract::CoreConfigExtractor;
    use crate::register::StateRegister;
    use crate::store::MemoryStore;
    use corewatch_core::{GlobalStatePatch, MonitorPhase, DEFAULT_MAX_RETRIES};
    use corewatch_protocol::PresentationEvent;
    use std::time::Duration;

    fn spawn() -> (Arc<StateRegister>, EventBus, MonitorHandle, CancellationToken) {
        let register = Arc::new(StateRegister::new(Arc::new(MemoryStore::new()), true));
        let events = EventBus::default();
        let shutdown = CancellationToken::new();
        let handle = spawn_monitor(
            MonitorSettings::default(),
            MonitorContext {
                register: register.clone(),
                extractor: Arc::new(CoreConfigExtractor),
                events: events.clone(),
                client: reqwest::Client::new(),
            },
            shutdown.clone(),
        );
        (register, events, handle, shutdown)
    }

    #[tokio::test]
    async fn test_start_requires_running_core() {
        let (_register, _events, handle, shutdown) = spawn();
        assert_eq!(handle.start().await, Err(MonitorError::CoreNotRunning));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_noop() {
        let (_register, _events, handle, shutdown) = spawn();
        let status = handle.stop().await.unwrap();
        assert_eq!(status.phase, MonitorPhase::Idle);
        assert!(!status.monitoring.is_monitoring);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_clear_history_publishes_reset() {
        let (_register, events, handle, shutdown) = spawn();
        let mut rx = events.subscribe();
        handle.clear_history().await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), PresentationEvent::ConnectionLogReset);

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.history_len, 0);
        assert!(snapshot.groups.domain.is_empty());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_start_without_api_address_backs_off() {
        let (register, _events, handle, shutdown) = spawn();
        register.update(GlobalStatePatch::none().running(true));

        let status = handle.start().await.unwrap();
        assert!(status.monitoring.is_monitoring);
        assert_eq!(status.phase, MonitorPhase::Backoff);
        assert_eq!(register.snapshot().connection_monitor.retry_count, 1);
        shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_runs_to_retry_ceiling() {
        let (register, events, handle, shutdown) = spawn();
        let mut rx = events.subscribe();
        register.update(GlobalStatePatch::none().running(true));
        handle.start().await.unwrap();

        // 2s + 4s + 8s + 16s of backoff, then the ceiling.
        tokio::time::sleep(Duration::from_secs(120)).await;

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.phase, MonitorPhase::Disabled);
        assert!(!snapshot.monitoring.is_monitoring);

        let monitor = register.snapshot().connection_monitor;
        assert!(!monitor.enabled);
        assert_eq!(monitor.retry_count, DEFAULT_MAX_RETRIES);

        let mut failed = None;
        while let Ok(event) = rx.try_recv() {
            if let PresentationEvent::ConnectionMonitoringFailed { retries, .. } = event {
                failed = Some(retries);
            }
        }
        assert_eq!(failed, Some(DEFAULT_MAX_RETRIES));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_bridge_rejects_after_shutdown() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let bridge = MonitorBridge { sender: tx };
        let notification = StateNotification {
            kind: StateEventKind::CoreStopped,
            old_state: Default::default(),
            new_state: Default::default(),
            changes: Vec::new(),
            timestamp: chrono::Utc::now(),
        };
        assert!(bridge.on_state_change(&notification).is_err());
    }
}
