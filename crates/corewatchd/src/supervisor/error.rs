//! Supervisor error types.

use std::path::PathBuf;
use std::time::Duration;

use corewatch_core::DomainError;
use thiserror::Error;

/// Typed failures of supervisor operations.
///
/// A crash after a successful start is never one of these; it is reported
/// through the exit callback and the `core-exited` event.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Core binary not installed at {}", .0.display())]
    NotInstalled(PathBuf),

    #[error("Core configuration not found: {}", .0.display())]
    ConfigMissing(PathBuf),

    #[error("No configuration path given and no default configured")]
    NoConfig,

    #[error("Invalid start override: {0}")]
    InvalidOverride(#[from] DomainError),

    #[error("Failed to spawn {}: {source}", binary.display())]
    SpawnFailed {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Core (pid {pid}) did not exit within {timeout:?}")]
    StopFailed { pid: u32, timeout: Duration },

    #[error("A stop is already in progress")]
    AlreadyStopping,
}

impl SupervisorError {
    /// Stable machine-readable kind, forwarded to clients as the error code.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotInstalled(_) => "not-installed",
            Self::ConfigMissing(_) | Self::NoConfig | Self::InvalidOverride(_) => "config-invalid",
            Self::SpawnFailed { .. } => "spawn-failure",
            Self::StopFailed { .. } => "stop-failure",
            Self::AlreadyStopping => "already-stopping",
        }
    }
}
