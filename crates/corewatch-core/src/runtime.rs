//! Runtime description of the supervised core process.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Default loopback address the core listens on.
pub const DEFAULT_PROXY_HOST: &str = "127.0.0.1";

/// Default mixed proxy port used before a configuration has been read.
pub const DEFAULT_PROXY_PORT: u16 = 7890;

// ============================================================================
// Proxy Runtime Config
// ============================================================================

/// Listen address of the running core and whether the OS proxy points at it.
///
/// The port is overwritten from the configuration file before each start,
/// so the file stays the source of truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyRuntimeConfig {
    pub host: String,
    pub port: u16,
    pub enable_system_proxy: bool,
}

impl Default for ProxyRuntimeConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_PROXY_HOST.to_string(),
            port: DEFAULT_PROXY_PORT,
            enable_system_proxy: false,
        }
    }
}

impl ProxyRuntimeConfig {
    /// Returns `host:port`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Host to hand to the OS proxy settings.
    ///
    /// A wildcard listen address is not routable, so loopback is used instead.
    pub fn system_proxy_host(&self) -> &str {
        match self.host.as_str() {
            "0.0.0.0" | "::" | "" => DEFAULT_PROXY_HOST,
            host => host,
        }
    }
}

// ============================================================================
// Core Family
// ============================================================================

/// The two supported core families. They differ only in command line shape
/// and configuration format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CoreFamily {
    #[default]
    Mihomo,
    SingBox,
}

impl CoreFamily {
    /// Builds the argument list for launching the core.
    pub fn args(&self, config: &Path, work_dir: &Path) -> Vec<String> {
        let config = config.display().to_string();
        let work_dir = work_dir.display().to_string();
        match self {
            Self::Mihomo => vec!["-d".to_string(), work_dir, "-f".to_string(), config],
            Self::SingBox => vec![
                "run".to_string(),
                "-c".to_string(),
                config,
                "-D".to_string(),
                work_dir,
            ],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mihomo => "mihomo",
            Self::SingBox => "sing-box",
        }
    }
}

impl fmt::Display for CoreFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CoreFamily {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mihomo" | "clash" | "clash-meta" => Ok(Self::Mihomo),
            "sing-box" | "singbox" => Ok(Self::SingBox),
            other => Err(DomainError::invalid("core family", other, "mihomo or sing-box")),
        }
    }
}

// ============================================================================
// Status and Exit
// ============================================================================

/// Result of a status query. Produced by scanning the process table, so it
/// also sees cores not spawned by this daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreStatus {
    pub is_running: bool,
    pub process_count: usize,
    pub pids: Vec<u32>,
    pub last_checked_at: DateTime<Utc>,
}

impl CoreStatus {
    pub fn from_pids(pids: Vec<u32>) -> Self {
        Self {
            is_running: !pids.is_empty(),
            process_count: pids.len(),
            pids,
            last_checked_at: Utc::now(),
        }
    }
}

/// Delivered to the caller-supplied exit callback once the core has exited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitReport {
    pub pid: u32,
    pub code: Option<i32>,
    /// Terminating signal on Unix, if any.
    pub signal: Option<i32>,
    /// True when the exit was requested through `stop`.
    pub requested: bool,
    /// Error text for an abnormal exit, typically the tail of stderr.
    pub error: Option<String>,
}

impl ExitReport {
    /// An unrequested exit with a nonzero code or a signal is a crash.
    pub fn is_crash(&self) -> bool {
        if self.requested {
            return false;
        }
        match self.code {
            Some(code) => code != 0,
            None => self.signal.is_some(),
        }
    }
}
