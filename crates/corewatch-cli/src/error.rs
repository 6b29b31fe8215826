//! Error types for the corewatch client.
//!
//! Connection problems, protocol problems and command failures reported by
//! the daemon are kept apart so the CLI can print a useful hint for each.
//!
//! **Panic-Free Policy:** No `.unwrap()`, `.expect()`, `panic!()`,
//! `unreachable!()`, or `todo!()` outside tests.

use std::io;
use thiserror::Error;

// ============================================================================
// Client Error Type
// ============================================================================

/// Client errors.
#[derive(Error, Debug)]
pub enum CliError {
    /// Failed to connect to the daemon.
    ///
    /// Usually the daemon is not running; `corewatchd start -d` fixes that.
    #[error("Failed to connect to daemon: {0}")]
    DaemonConnection(String),

    /// Protocol version mismatch with daemon
    #[error("Protocol version mismatch (client: {client_version}, daemon: {daemon_version})")]
    VersionMismatch {
        client_version: String,
        daemon_version: String,
    },

    /// The daemon sent something this client did not expect.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// The daemon ran the command and reported a failure.
    ///
    /// `code` is the daemon's stable error kind (`not-installed`,
    /// `config-invalid`, ...).
    #[error("{message}")]
    Command {
        message: String,
        code: Option<String>,
    },

    /// No reply within the request timeout.
    #[error("Daemon did not answer within {0:?}")]
    Timeout(std::time::Duration),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to parse message: {0}")]
    ParseError(#[from] serde_json::Error),
}

impl CliError {
    /// The daemon's error code, for command failures that carry one.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Command { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// True when retrying later (after the daemon comes up) could help.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::DaemonConnection(_) | Self::Io(_))
    }
}

// ============================================================================
// Result Type Alias
// ============================================================================

/// Convenience Result type alias for client operations.
pub type Result<T> = std::result::Result<T, CliError>;

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daemon_connection_error_display() {
        let error = CliError::DaemonConnection("connection refused".to_string());
        let display = format!("{error}");
        assert!(display.contains("Failed to connect to daemon"));
        assert!(display.contains("refused"));
        assert!(error.is_connection());
    }

    #[test]
    fn test_version_mismatch_error_display() {
        let error = CliError::VersionMismatch {
            client_version: "1.0".to_string(),
            daemon_version: "2.0".to_string(),
        };
        let display = format!("{error}");
        assert!(display.contains("client: 1.0"));
        assert!(display.contains("daemon: 2.0"));
        assert!(!error.is_connection());
    }

    #[test]
    fn test_command_error_carries_code() {
        let error = CliError::Command {
            message: "Core binary not installed at /opt/mihomo".to_string(),
            code: Some("not-installed".to_string()),
        };
        assert_eq!(error.to_string(), "Core binary not installed at /opt/mihomo");
        assert_eq!(error.code(), Some("not-installed"));
    }

    #[test]
    fn test_parse_error_from_conversion() {
        let json_error = serde_json::from_str::<serde_json::Value>("{ invalid").unwrap_err();
        let error: CliError = json_error.into();
        assert!(matches!(error, CliError::ParseError(_)));
        assert!(error.code().is_none());
    }
}
