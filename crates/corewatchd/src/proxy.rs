//! OS-level system proxy toggling.
//!
//! The supervisor only needs two operations, so the seam is a small trait.
//! [`SystemProxyToggle`] shells out to the platform's settings tool;
//! [`NoopProxyToggle`] is used on hosts without a supported settings tool.

use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::store::StateStore;

/// Store key recording that the system proxy was set by corewatch.
pub const PROXY_ACTIVE_KEY: &str = "proxy.systemProxyActive";

/// Sets and clears the system-wide proxy.
pub trait ProxyToggle: Send + Sync {
    fn enable(&self, host: &str, port: u16) -> bool;

    /// Clears the proxy. Must be idempotent.
    fn disable(&self) -> bool;
}

/// Accepts every call and changes nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProxyToggle;

impl ProxyToggle for NoopProxyToggle {
    fn enable(&self, host: &str, port: u16) -> bool {
        debug!(host, port, "System proxy toggle disabled, not enabling");
        true
    }

    fn disable(&self) -> bool {
        true
    }
}

/// The settings tool family for the current platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyBackend {
    /// GNOME `gsettings`
    Gsettings,
    /// macOS `networksetup`, applied to one network service
    Networksetup,
    /// Windows registry via `reg`
    Registry,
}

impl ProxyBackend {
    pub fn detect() -> Option<Self> {
        if cfg!(target_os = "macos") {
            Some(Self::Networksetup)
        } else if cfg!(target_os = "windows") {
            Some(Self::Registry)
        } else if cfg!(target_os = "linux") {
            Some(Self::Gsettings)
        } else {
            None
        }
    }
}

const WINDOWS_INTERNET_SETTINGS: &str =
    r"HKCU\Software\Microsoft\Windows\CurrentVersion\Internet Settings";

type Invocation = (&'static str, Vec<String>);

fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Commands that point the system proxy at `host:port`.
pub fn enable_commands(backend: ProxyBackend, service: &str, host: &str, port: u16) -> Vec<Invocation> {
    let port = port.to_string();
    match backend {
        ProxyBackend::Gsettings => {
            let mut commands = vec![(
                "gsettings",
                args(&["set", "org.gnome.system.proxy", "mode", "manual"]),
            )];
            for scheme in ["http", "https", "socks"] {
                let schema = format!("org.gnome.system.proxy.{scheme}");
                commands.push(("gsettings", args(&["set", &schema, "host", host])));
                commands.push(("gsettings", args(&["set", &schema, "port", &port])));
            }
            commands
        }
        ProxyBackend::Networksetup => vec![
            ("networksetup", args(&["-setwebproxy", service, host, &port])),
            ("networksetup", args(&["-setsecurewebproxy", service, host, &port])),
            ("networksetup", args(&["-setsocksfirewallproxy", service, host, &port])),
        ],
        ProxyBackend::Registry => {
            let server = format!("{host}:{port}");
            vec![
                (
                    "reg",
                    args(&[
                        "add",
                        WINDOWS_INTERNET_SETTINGS,
                        "/v",
                        "ProxyServer",
                        "/t",
                        "REG_SZ",
                        "/d",
                        &server,
                        "/f",
                    ]),
                ),
                (
                    "reg",
                    args(&[
                        "add",
                        WINDOWS_INTERNET_SETTINGS,
                        "/v",
                        "ProxyEnable",
                        "/t",
                        "REG_DWORD",
                        "/d",
                        "1",
                        "/f",
                    ]),
                ),
            ]
        }
    }
}

/// Commands that clear the system proxy.
pub fn disable_commands(backend: ProxyBackend, service: &str) -> Vec<Invocation> {
    match backend {
        ProxyBackend::Gsettings => vec![(
            "gsettings",
            args(&["set", "org.gnome.system.proxy", "mode", "none"]),
        )],
        ProxyBackend::Networksetup => vec![
            ("networksetup", args(&["-setwebproxystate", service, "off"])),
            ("networksetup", args(&["-setsecurewebproxystate", service, "off"])),
            ("networksetup", args(&["-setsocksfirewallproxystate", service, "off"])),
        ],
        ProxyBackend::Registry => vec![(
            "reg",
            args(&[
                "add",
                WINDOWS_INTERNET_SETTINGS,
                "/v",
                "ProxyEnable",
                "/t",
                "REG_DWORD",
                "/d",
                "0",
                "/f",
            ]),
        )],
    }
}

fn run_all(commands: &[Invocation]) -> bool {
    commands.iter().all(|(program, args)| {
        match Command::new(program).args(args).status() {
            Ok(status) if status.success() => true,
            Ok(status) => {
                warn!(program, ?args, %status, "Proxy command failed");
                false
            }
            Err(e) => {
                warn!(program, error = %e, "Failed to run proxy command");
                false
            }
        }
    })
}

/// Toggles the proxy through the platform settings tool.
///
/// `disable` only touches OS settings after corewatch enabled them, so a
/// user's own proxy configuration is left alone. With a store attached the
/// marker outlives the process: a daemon that died with the proxy on leaves
/// it set, and the next daemon's `disable` clears it.
pub struct SystemProxyToggle {
    backend: ProxyBackend,
    /// macOS network service name
    service: String,
    active: AtomicBool,
    store: Option<Arc<dyn StateStore>>,
}

impl SystemProxyToggle {
    pub fn new(backend: ProxyBackend) -> Self {
        Self {
            backend,
            service: "Wi-Fi".to_string(),
            active: AtomicBool::new(false),
            store: None,
        }
    }

    /// Persists the active marker in `store`, picking up one left by an
    /// earlier process.
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        let leftover = matches!(store.get(PROXY_ACTIVE_KEY), Some(Value::Bool(true)));
        if leftover {
            warn!("System proxy left enabled by a previous run");
        }
        self.active = AtomicBool::new(leftover);
        self.store = Some(store);
        self
    }

    fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
        if let Some(store) = &self.store {
            if !store.set(PROXY_ACTIVE_KEY, Value::Bool(active)) {
                warn!(active, "Failed to persist system proxy marker");
            }
        }
    }

    /// Uses the detected backend, or `None` on unsupported platforms.
    pub fn detect() -> Option<Self> {
        ProxyBackend::detect().map(Self::new)
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    pub fn backend(&self) -> ProxyBackend {
        self.backend
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl ProxyToggle for SystemProxyToggle {
    fn enable(&self, host: &str, port: u16) -> bool {
        let ok = run_all(&enable_commands(self.backend, &self.service, host, port));
        if ok {
            self.set_active(true);
            info!(host, port, backend = ?self.backend, "System proxy enabled");
        }
        ok
    }

    fn disable(&self) -> bool {
        if !self.active.load(Ordering::SeqCst) {
            return true;
        }
        let ok = run_all(&disable_commands(self.backend, &self.service));
        if ok {
            self.set_active(false);
            info!(backend = ?self.backend, "System proxy disabled");
        }
        ok
    }
}

impl Drop for SystemProxyToggle {
    fn drop(&mut self) {
        if self.active.load(Ordering::SeqCst) {
            warn!("Proxy toggle dropped while active, clearing system proxy");
            if run_all(&disable_commands(self.backend, &self.service)) {
                self.set_active(false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_gsettings_commands() {
        let commands = enable_commands(ProxyBackend::Gsettings, "", "127.0.0.1", 7890);
        assert_eq!(commands.len(), 7);
        assert_eq!(commands[0].1, vec!["set", "org.gnome.system.proxy", "mode", "manual"]);
        assert!(commands
            .iter()
            .any(|(_, a)| a == &vec!["set", "org.gnome.system.proxy.socks", "port", "7890"]));

        let off = disable_commands(ProxyBackend::Gsettings, "");
        assert_eq!(off[0].1.last().map(String::as_str), Some("none"));
    }

    #[test]
    fn test_networksetup_uses_service() {
        let commands = enable_commands(ProxyBackend::Networksetup, "Ethernet", "127.0.0.1", 7891);
        assert!(commands.iter().all(|(p, a)| *p == "networksetup" && a[1] == "Ethernet"));
    }

    #[test]
    fn test_registry_proxy_server_value() {
        let commands = enable_commands(ProxyBackend::Registry, "", "127.0.0.1", 7890);
        assert!(commands[0].1.contains(&"127.0.0.1:7890".to_string()));
    }

    #[test]
    fn test_inactive_disable_is_noop() {
        let toggle = SystemProxyToggle::new(ProxyBackend::Gsettings);
        assert!(!toggle.is_active());
        assert!(toggle.disable());
        assert!(toggle.disable());
    }

    #[test]
    fn test_store_marker_restores_active_flag() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let fresh = SystemProxyToggle::new(ProxyBackend::Gsettings).with_store(store.clone());
        assert!(!fresh.is_active());
        assert!(fresh.disable());

        // A previous run enabled the proxy and died without clearing it.
        assert!(store.set(PROXY_ACTIVE_KEY, Value::Bool(true)));
        let after_crash = SystemProxyToggle::new(ProxyBackend::Gsettings).with_store(store.clone());
        assert!(after_crash.is_active());

        // Leave OS settings alone when the toggle is dropped in the test.
        after_crash.active.store(false, Ordering::SeqCst);
    }

    #[test]
    fn test_noop_toggle() {
        assert!(NoopProxyToggle.enable("127.0.0.1", 7890));
        assert!(NoopProxyToggle.disable());
    }
}
