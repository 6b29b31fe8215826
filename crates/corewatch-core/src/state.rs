//! Process-wide run state and the notifications emitted when it changes.
//!
//! `GlobalState` is the value held by the daemon's state register. It is
//! only ever mutated by applying a [`GlobalStatePatch`], which reports the
//! fields that actually changed so listeners can react selectively.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Defaults
// ============================================================================

/// Default retry ceiling for the connection monitor.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default base delay between reconnect attempts, in milliseconds.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 2_000;

// ============================================================================
// Global State
// ============================================================================

/// Connection-monitor sub-state tracked by the register.
///
/// Invariant: `retry_count <= max_retries`, and reaching the ceiling
/// forces `enabled = false`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionMonitorState {
    pub enabled: bool,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Base reconnect delay in milliseconds.
    pub retry_delay: u64,
    pub last_retry_time: Option<DateTime<Utc>>,
}

impl Default for ConnectionMonitorState {
    fn default() -> Self {
        Self {
            enabled: false,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY_MS,
            last_retry_time: None,
        }
    }
}

impl ConnectionMonitorState {
    /// Returns true once `retry_count` has reached `max_retries`.
    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

/// Cross-cutting run state of the supervised core.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalState {
    pub is_running: bool,
    pub is_initialized: bool,
    pub last_error: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    /// Configuration file the running core was started with.
    #[serde(default)]
    pub config_path: Option<PathBuf>,
    pub connection_monitor: ConnectionMonitorState,
}

// ============================================================================
// Patches
// ============================================================================

/// Names of the top-level fields a patch can change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StateField {
    IsRunning,
    IsInitialized,
    LastError,
    StartTime,
    ConfigPath,
    ConnectionMonitor,
}

impl StateField {
    /// Returns the camelCase name used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IsRunning => "isRunning",
            Self::IsInitialized => "isInitialized",
            Self::LastError => "lastError",
            Self::StartTime => "startTime",
            Self::ConfigPath => "configPath",
            Self::ConnectionMonitor => "connectionMonitor",
        }
    }
}

impl fmt::Display for StateField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A shallow, partial replacement of [`GlobalState`].
///
/// `None` leaves a field untouched. Nullable fields use a nested `Option`
/// so that "clear the value" (`Some(None)`) is distinct from "leave it".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalStatePatch {
    pub is_running: Option<bool>,
    pub is_initialized: Option<bool>,
    pub last_error: Option<Option<String>>,
    pub start_time: Option<Option<DateTime<Utc>>>,
    pub config_path: Option<Option<PathBuf>>,
    pub connection_monitor: Option<ConnectionMonitorState>,
}

impl GlobalStatePatch {
    /// An empty patch, used for pure lifecycle notifications.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn running(mut self, value: bool) -> Self {
        self.is_running = Some(value);
        self
    }

    pub fn initialized(mut self, value: bool) -> Self {
        self.is_initialized = Some(value);
        self
    }

    pub fn last_error(mut self, value: Option<String>) -> Self {
        self.last_error = Some(value);
        self
    }

    pub fn start_time(mut self, value: Option<DateTime<Utc>>) -> Self {
        self.start_time = Some(value);
        self
    }

    pub fn config_path(mut self, value: Option<PathBuf>) -> Self {
        self.config_path = Some(value);
        self
    }

    pub fn connection_monitor(mut self, value: ConnectionMonitorState) -> Self {
        self.connection_monitor = Some(value);
        self
    }

    /// Returns true if the patch does not touch any field.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Merges the patch into `state` and returns the fields whose value changed.
    ///
    /// Fields set to their current value are not reported.
    pub fn apply(self, state: &mut GlobalState) -> Vec<StateField> {
        let mut changes = Vec::new();

        if let Some(value) = self.is_running {
            if state.is_running != value {
                state.is_running = value;
                changes.push(StateField::IsRunning);
            }
        }
        if let Some(value) = self.is_initialized {
            if state.is_initialized != value {
                state.is_initialized = value;
                changes.push(StateField::IsInitialized);
            }
        }
        if let Some(value) = self.last_error {
            if state.last_error != value {
                state.last_error = value;
                changes.push(StateField::LastError);
            }
        }
        if let Some(value) = self.start_time {
            if state.start_time != value {
                state.start_time = value;
                changes.push(StateField::StartTime);
            }
        }
        if let Some(value) = self.config_path {
            if state.config_path != value {
                state.config_path = value;
                changes.push(StateField::ConfigPath);
            }
        }
        if let Some(value) = self.connection_monitor {
            if state.connection_monitor != value {
                state.connection_monitor = value;
                changes.push(StateField::ConnectionMonitor);
            }
        }

        changes
    }
}

// ============================================================================
// Notifications
// ============================================================================

/// What triggered a state notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StateEventKind {
    /// Plain field update.
    StateUpdate,
    CoreStarted,
    CoreStopping,
    CoreStopped,
    ConnectionMonitorEnabled,
    ConnectionMonitorDisabled,
    ConnectionMonitorReset,
    ConnectionRetry,
    /// The retry ceiling was reached; terminal until the next explicit enable.
    MaxRetries,
}

impl StateEventKind {
    /// Returns the kebab-case name used in logs and on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StateUpdate => "state-update",
            Self::CoreStarted => "core-started",
            Self::CoreStopping => "core-stopping",
            Self::CoreStopped => "core-stopped",
            Self::ConnectionMonitorEnabled => "connection-monitor-enabled",
            Self::ConnectionMonitorDisabled => "connection-monitor-disabled",
            Self::ConnectionMonitorReset => "connection-monitor-reset",
            Self::ConnectionRetry => "connection-retry",
            Self::MaxRetries => "max-retries",
        }
    }

    /// Returns true for the supervisor lifecycle events.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            Self::CoreStarted | Self::CoreStopping | Self::CoreStopped
        )
    }
}

impl fmt::Display for StateEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivered to every register listener after a mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateNotification {
    #[serde(rename = "type")]
    pub kind: StateEventKind,
    pub old_state: GlobalState,
    pub new_state: GlobalState,
    pub changes: Vec<StateField>,
    pub timestamp: DateTime<Utc>,
}

impl StateNotification {
    /// Returns true if `field` changed in this notification.
    pub fn changed(&self, field: StateField) -> bool {
        self.changes.contains(&field)
    }
}

// ============================================================================
// Persistence
// ============================================================================

/// Snapshot written to the persistent store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    pub state: GlobalState,
    /// True when captured by a development build or `COREWATCH_ENV=development`.
    pub development: bool,
    pub saved_at: DateTime<Utc>,
}

impl PersistedState {
    /// Returns true if this snapshot may be reloaded by a run with the given mode.
    ///
    /// A development snapshot is never reloaded by a production run.
    pub fn is_loadable_in(&self, development: bool) -> bool {
        development || !self.development
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_reports_only_changed_fields() {
        let mut state = GlobalState::default();
        let changes = GlobalStatePatch::none()
            .running(true)
            .initialized(false)
            .last_error(None)
            .apply(&mut state);

        assert_eq!(changes, vec![StateField::IsRunning]);
        assert!(state.is_running);
    }

    #[test]
    fn test_apply_clears_nullable_field() {
        let mut state = GlobalState {
            last_error: Some("boom".to_string()),
            ..Default::default()
        };
        let changes = GlobalStatePatch::none().last_error(None).apply(&mut state);

        assert_eq!(changes, vec![StateField::LastError]);
        assert!(state.last_error.is_none());
    }

    #[test]
    fn test_empty_patch() {
        let mut state = GlobalState::default();
        let patch = GlobalStatePatch::none();
        assert!(patch.is_empty());
        assert!(patch.apply(&mut state).is_empty());
    }

    #[test]
    fn test_monitor_exhausted() {
        let mut monitor = ConnectionMonitorState::default();
        assert!(!monitor.is_exhausted());
        monitor.retry_count = monitor.max_retries;
        assert!(monitor.is_exhausted());
    }

    #[test]
    fn test_event_kind_names() {
        assert_eq!(StateEventKind::CoreStarted.as_str(), "core-started");
        assert_eq!(StateEventKind::MaxRetries.to_string(), "max-retries");
        let json = serde_json::to_string(&StateEventKind::ConnectionMonitorEnabled).unwrap();
        assert_eq!(json, "\"connection-monitor-enabled\"");
        assert!(StateEventKind::CoreStopping.is_lifecycle());
        assert!(!StateEventKind::ConnectionRetry.is_lifecycle());
    }

    #[test]
    fn test_development_snapshot_not_loadable_in_production() {
        let snapshot = PersistedState {
            state: GlobalState::default(),
            development: true,
            saved_at: Utc::now(),
        };
        assert!(!snapshot.is_loadable_in(false));
        assert!(snapshot.is_loadable_in(true));

        let production = PersistedState {
            development: false,
            ..snapshot
        };
        assert!(production.is_loadable_in(false));
        assert!(production.is_loadable_in(true));
    }

    #[test]
    fn test_state_serializes_camel_case() {
        let state = GlobalState {
            is_running: true,
            ..Default::default()
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["isRunning"], true);
        assert_eq!(json["connectionMonitor"]["maxRetries"], DEFAULT_MAX_RETRIES);
    }
}
