//! Monitor actor commands and errors.

use corewatch_core::{ConnectionSnapshot, MonitorPhase, MonitoringState, StateNotification};
use thiserror::Error;
use tokio::sync::oneshot;

use super::stream::{ConnectionToken, StreamMessage};

/// Errors returned to monitor handle callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MonitorError {
    #[error("Core is not running")]
    CoreNotRunning,

    #[error("Monitor actor channel closed")]
    ChannelClosed,
}

impl MonitorError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CoreNotRunning => "core-not-running",
            Self::ChannelClosed => "channel-closed",
        }
    }
}

/// Reply to start and stop requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorStatus {
    pub phase: MonitorPhase,
    pub monitoring: MonitoringState,
}

/// Commands processed in order by the monitor actor.
///
/// Requests from handles carry a oneshot for the reply; stream reports and
/// timer expiries are fire-and-forget and tagged with the token they were
/// issued under.
#[derive(Debug)]
pub enum MonitorCommand {
    /// Begin or resume monitoring.
    Start {
        respond_to: oneshot::Sender<Result<MonitorStatus, MonitorError>>,
    },

    /// Stop monitoring. Arms the preserve window.
    Stop {
        respond_to: oneshot::Sender<MonitorStatus>,
    },

    ClearHistory {
        respond_to: oneshot::Sender<()>,
    },

    Snapshot {
        respond_to: oneshot::Sender<ConnectionSnapshot>,
    },

    /// A forwarded state register notification.
    Lifecycle(Box<StateNotification>),

    Stream(StreamMessage),

    /// Backoff elapsed.
    Reconnect { token: ConnectionToken },

    /// Preserve window elapsed.
    PreserveExpired { token: ConnectionToken },
}
