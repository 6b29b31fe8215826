//! Extraction of the proxy port and diagnostic API address from a core
//! configuration file.
//!
//! mihomo configs are YAML (`mixed-port`, `external-controller`, `secret`);
//! sing-box configs are JSON (`inbounds[].listen_port`,
//! `experimental.clash_api.external_controller`). Only the handful of keys
//! the supervisor and monitor need are read; the rest of the file is ignored.

use std::path::Path;

use serde_json::Value;
use tracing::debug;

/// What the supervisor and monitor need from a core configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedConfig {
    pub port: u16,
    /// `host:port` of the diagnostic API, normalized to a dialable host.
    pub api_address: Option<String>,
    /// Bearer secret for the diagnostic API.
    pub secret: Option<String>,
}

impl ExtractedConfig {
    /// Base URL of the diagnostic API.
    pub fn api_base_url(&self) -> Option<String> {
        self.api_address.as_ref().map(|addr| format!("http://{addr}"))
    }
}

/// Reads a core configuration file.
pub trait ConfigPortExtractor: Send + Sync {
    /// Returns `None` when the file is unreadable or names no port.
    fn parse(&self, config_path: &Path) -> Option<ExtractedConfig>;
}

/// Handles both supported formats, chosen by file extension.
#[derive(Debug, Default, Clone, Copy)]
pub struct CoreConfigExtractor;

impl ConfigPortExtractor for CoreConfigExtractor {
    fn parse(&self, config_path: &Path) -> Option<ExtractedConfig> {
        let text = match std::fs::read_to_string(config_path) {
            Ok(text) => text,
            Err(e) => {
                debug!(path = %config_path.display(), error = %e, "Config unreadable");
                return None;
            }
        };

        let extension = config_path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);

        match extension.as_deref() {
            Some("json") => parse_sing_box(&text),
            Some("yaml") | Some("yml") => parse_mihomo(&text),
            _ => parse_sing_box(&text).or_else(|| parse_mihomo(&text)),
        }
    }
}

fn as_port(value: &Value) -> Option<u16> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|port| *port != 0)
}

fn non_empty(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Makes a listen address dialable: fills an empty host and replaces wildcards.
pub fn normalize_api_address(addr: &str) -> Option<String> {
    let addr = addr.trim();
    if addr.is_empty() {
        return None;
    }
    let (host, port) = addr.rsplit_once(':')?;
    let host = match host.trim_matches(|c| c == '[' || c == ']') {
        "" | "0.0.0.0" | "::" => "127.0.0.1",
        other => other,
    };
    if host.contains(':') {
        Some(format!("[{host}]:{port}"))
    } else {
        Some(format!("{host}:{port}"))
    }
}

/// mihomo YAML.
pub fn parse_mihomo(text: &str) -> Option<ExtractedConfig> {
    let doc: Value = serde_yaml::from_str(text).ok()?;

    let port = ["mixed-port", "port", "socks-port"]
        .iter()
        .find_map(|key| doc.get(*key).and_then(as_port))?;

    Some(ExtractedConfig {
        port,
        api_address: non_empty(doc.get("external-controller"))
            .and_then(|addr| normalize_api_address(&addr)),
        secret: non_empty(doc.get("secret")),
    })
}

/// sing-box JSON.
pub fn parse_sing_box(text: &str) -> Option<ExtractedConfig> {
    let doc: Value = serde_json::from_str(text).ok()?;

    let port = doc
        .get("inbounds")
        .and_then(Value::as_array)?
        .iter()
        .filter(|inbound| {
            matches!(
                inbound.get("type").and_then(Value::as_str),
                Some("mixed") | Some("http") | Some("socks")
            )
        })
        .find_map(|inbound| inbound.get("listen_port").and_then(as_port))?;

    let clash_api = doc.get("experimental").and_then(|e| e.get("clash_api"));

    Some(ExtractedConfig {
        port,
        api_address: non_empty(clash_api.and_then(|api| api.get("external_controller")))
            .and_then(|addr| normalize_api_address(&addr)),
        secret: non_empty(clash_api.and_then(|api| api.get("secret"))),
    })
}
