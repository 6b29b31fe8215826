//! Events pushed to subscribed clients.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use corewatch_core::{ConnectionLogEntry, ExitReport, GroupsSnapshot};
use serde::{Deserialize, Serialize};

/// Which pipe of the core a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// The event half of the presentation surface.
///
/// Graceful stops and failures travel as different variants so a client
/// can tell "I asked it to stop" from "it broke".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum PresentationEvent {
    CoreStarted {
        #[serde(skip_serializing_if = "Option::is_none")]
        config_path: Option<PathBuf>,
        #[serde(skip_serializing_if = "Option::is_none")]
        start_time: Option<DateTime<Utc>>,
    },
    CoreStopping,
    CoreStopped,
    /// `isRunning` changed in the global state.
    StatusChanged { is_running: bool },
    CoreOutput { stream: OutputStream, line: String },
    /// The core process exited, requested or not.
    CoreExited(ExitReport),
    ConnectionMonitoringStarted {
        /// True when a preserved stream was resumed instead of reopened.
        resumed: bool,
    },
    ConnectionMonitoringStopped {
        #[serde(skip_serializing_if = "Option::is_none")]
        preserve_until: Option<DateTime<Utc>>,
    },
    ConnectionLog { entry: Box<ConnectionLogEntry> },
    ConnectionGroups { groups: GroupsSnapshot },
    /// Clients should drop their connection view and start fresh.
    ConnectionLogReset,
    /// Retry ceiling reached. Monitoring stays off until explicitly enabled.
    ConnectionMonitoringFailed { retries: u32, reason: String },
}

impl PresentationEvent {
    /// The wire name of this event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::CoreStarted { .. } => "core-started",
            Self::CoreStopping => "core-stopping",
            Self::CoreStopped => "core-stopped",
            Self::StatusChanged { .. } => "status-changed",
            Self::CoreOutput { .. } => "core-output",
            Self::CoreExited(_) => "core-exited",
            Self::ConnectionMonitoringStarted { .. } => "connection-monitoring-started",
            Self::ConnectionMonitoringStopped { .. } => "connection-monitoring-stopped",
            Self::ConnectionLog { .. } => "connection-log",
            Self::ConnectionGroups { .. } => "connection-groups",
            Self::ConnectionLogReset => "connection-log-reset",
            Self::ConnectionMonitoringFailed { .. } => "connection-monitoring-failed",
        }
    }

    /// Error kind for events that report a failure: `process-crash` for an
    /// unrequested exit, `retry-ceiling-reached` for terminal monitor failure.
    pub fn error_kind(&self) -> Option<&'static str> {
        match self {
            Self::CoreExited(report) if report.is_crash() => Some("process-crash"),
            Self::ConnectionMonitoringFailed { .. } => Some("retry-ceiling-reached"),
            _ => None,
        }
    }

    /// High-volume events a client may choose to skip.
    pub fn is_high_volume(&self) -> bool {
        matches!(
            self,
            Self::CoreOutput { .. } | Self::ConnectionLog { .. } | Self::ConnectionGroups { .. }
        )
    }
}
