//! Daemon configuration loaded from TOML.
//!
//! Every field has a default, so a missing file is not an error. Lookup order
//! for the file: explicit path, `COREWATCH_CONFIG`, then
//! `<config dir>/corewatch/config.toml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use corewatch_core::{CoreFamily, ProxyRuntimeConfig, DEFAULT_PROXY_HOST, DEFAULT_PROXY_PORT};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "COREWATCH_CONFIG";

/// Environment variable overriding the daemon socket path.
pub const SOCKET_ENV: &str = "COREWATCH_SOCKET";

/// Set to `development` to mark persisted state as captured in development.
pub const ENV_MODE: &str = "COREWATCH_ENV";

/// Default socket path
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/corewatch.sock";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub fn kind(&self) -> &'static str {
        "config-invalid"
    }
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("corewatch")
}

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreSection {
    /// Path to the core executable.
    pub binary: PathBuf,
    pub family: CoreFamily,
    /// Configuration used when a start request names none.
    pub config: Option<PathBuf>,
    pub work_dir: PathBuf,
}

impl Default for CoreSection {
    fn default() -> Self {
        let dir = data_dir().join("core");
        Self {
            binary: dir.join("mihomo"),
            family: CoreFamily::Mihomo,
            config: None,
            work_dir: dir,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySection {
    pub host: String,
    pub port: u16,
    pub enable_system_proxy: bool,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            host: DEFAULT_PROXY_HOST.to_string(),
            port: DEFAULT_PROXY_PORT,
            enable_system_proxy: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSection {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub preserve_secs: u64,
    pub idle_timeout_secs: u64,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 2_000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            preserve_secs: 30,
            idle_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartSection {
    pub settle_ms: u64,
}

impl Default for RestartSection {
    fn default() -> Self {
        Self { settle_ms: 1_000 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateSection {
    pub path: PathBuf,
}

impl Default for StateSection {
    fn default() -> Self {
        Self {
            path: data_dir().join("state.json"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSection {
    pub socket: PathBuf,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            socket: PathBuf::from(DEFAULT_SOCKET_PATH),
        }
    }
}

// ============================================================================
// Daemon Config
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub core: CoreSection,
    pub proxy: ProxySection,
    pub monitor: MonitorSection,
    pub restart: RestartSection,
    pub state: StateSection,
    pub daemon: DaemonSection,
}

impl DaemonConfig {
    /// Resolves the config file location.
    pub fn resolve_path(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            if !path.is_empty() {
                return Some(PathBuf::from(path));
            }
        }
        dirs::config_dir().map(|dir| dir.join("corewatch").join("config.toml"))
    }

    /// Loads the configuration. A missing file yields defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        match Self::resolve_path(explicit) {
            Some(path) if path.exists() => Self::from_file(&path),
            Some(path) => {
                debug!(path = %path.display(), "No config file, using defaults");
                Ok(Self::default())
            }
            None => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Socket path, honoring `COREWATCH_SOCKET`.
    pub fn socket_path(&self) -> PathBuf {
        match std::env::var(SOCKET_ENV) {
            Ok(path) if !path.is_empty() => PathBuf::from(path),
            _ => self.daemon.socket.clone(),
        }
    }

    /// True for debug builds or when `COREWATCH_ENV=development`.
    pub fn is_development(&self) -> bool {
        cfg!(debug_assertions)
            || std::env::var(ENV_MODE)
                .map(|mode| mode.eq_ignore_ascii_case("development"))
                .unwrap_or(false)
    }

    /// Initial runtime config. The port is replaced from the core config on start.
    pub fn runtime(&self) -> ProxyRuntimeConfig {
        ProxyRuntimeConfig {
            host: self.proxy.host.clone(),
            port: self.proxy.port,
            enable_system_proxy: self.proxy.enable_system_proxy,
        }
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.restart.settle_ms)
    }
}
