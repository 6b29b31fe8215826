//! Best-effort decoding of diagnostic log payloads into [`ConnectionLogEntry`].
//!
//! The log format belongs to the core, not to us. Two shapes are recognised:
//!
//! ```text
//! [3572196284 12ms] outbound/vless[proxy]: outbound connection to example.com:443
//! [TCP] 127.0.0.1:52341 --> example.com:443 match DomainSuffix(example.com) using Proxy
//! ```
//!
//! Anything that does not match leaves the corresponding field at
//! [`UNKNOWN`], so aggregation keys are always present.
//!
//! # Panic-Free Guarantees
//!
//! Patterns are compiled lazily into `Option<Regex>`; a pattern that fails
//! to compile degrades to "no match" instead of panicking.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::connection::{ConnectionLogEntry, Direction, UNKNOWN};

static SESSION_RE: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(
        r"\[(?P<session>\d+)[^\]]*\]\s+(?P<direction>inbound|outbound)/(?P<network>[\w\-]+)(?:\[(?P<group>[^\]]*)\])?:\s*(?P<info>.*)",
    )
    .ok()
});

static DELAY_RE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"\[\d+\s+(?P<delay>\d+(?:\.\d+)?(?:ms|s))\]").ok());

static TARGET_RE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"\bto\s+(?P<host>\S+)").ok());

static SOURCE_RE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"\bfrom\s+(?P<host>\S+)").ok());

static RULE_RE: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(
        r"\[(?P<network>TCP|UDP)\]\s+(?P<src>\S+)\s+-->\s+(?P<dst>\S+)(?:\s+match\s+.*?\s+using\s+(?P<group>.+))?",
    )
    .ok()
});

fn captures<'t>(re: &Lazy<Option<Regex>>, text: &'t str) -> Option<Captures<'t>> {
    re.as_ref().and_then(|re| re.captures(text))
}

fn field(caps: &Captures<'_>, name: &str) -> Option<String> {
    caps.name(name)
        .map(|m| m.as_str().trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Removes a trailing `:port` and IPv6 brackets from an address.
fn strip_port(addr: &str) -> &str {
    if let Some(rest) = addr.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match addr.rsplit_once(':') {
        Some((host, port))
            if !host.contains(':') && !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) =>
        {
            host
        }
        _ => addr,
    }
}

fn host_from(info: &str) -> Option<String> {
    captures(&TARGET_RE, info)
        .or_else(|| captures(&SOURCE_RE, info))
        .and_then(|caps| field(&caps, "host"))
        .map(|host| strip_port(&host).to_string())
        .filter(|host| !host.is_empty())
}

/// Decodes one payload. Never fails; unmatched fields become [`UNKNOWN`].
pub fn decode_entry(log_type: &str, payload: &str, timestamp: DateTime<Utc>) -> ConnectionLogEntry {
    let mut entry = ConnectionLogEntry {
        session_id: UNKNOWN.to_string(),
        domain: UNKNOWN.to_string(),
        network_type: UNKNOWN.to_string(),
        node_group: UNKNOWN.to_string(),
        direction: Direction::Unknown,
        delay: UNKNOWN.to_string(),
        log_type: if log_type.is_empty() {
            UNKNOWN.to_string()
        } else {
            log_type.to_string()
        },
        payload: payload.to_string(),
        timestamp,
    };

    if let Some(caps) = captures(&SESSION_RE, payload) {
        if let Some(session) = field(&caps, "session") {
            entry.session_id = session;
        }
        if let Some(direction) = field(&caps, "direction") {
            entry.direction = Direction::from_token(&direction);
        }
        if let Some(network) = field(&caps, "network") {
            entry.network_type = network;
        }
        if let Some(group) = field(&caps, "group") {
            entry.node_group = group;
        }
        if let Some(host) = field(&caps, "info").and_then(|info| host_from(&info)) {
            entry.domain = host;
        }
    } else if let Some(caps) = captures(&RULE_RE, payload) {
        entry.direction = Direction::Outbound;
        if let Some(network) = field(&caps, "network") {
            entry.network_type = network.to_ascii_lowercase();
        }
        if let Some(dst) = field(&caps, "dst") {
            entry.domain = strip_port(&dst).to_string();
        }
        if let Some(group) = field(&caps, "group") {
            entry.node_group = group;
        }
    }

    if let Some(delay) = captures(&DELAY_RE, payload).and_then(|caps| field(&caps, "delay")) {
        entry.delay = delay;
    }

    entry
}
