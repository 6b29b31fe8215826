//! Connection log domain: decoded entries, bounded history and the four
//! aggregation maps built from them.
//!
//! # Panic-Free Guarantees
//!
//! Eviction works on `Option`s returned by iterator adaptors; no indexing.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Capacities
// ============================================================================

/// Sentinel used for any field the decoder could not extract.
pub const UNKNOWN: &str = "unknown";

/// Maximum number of entries kept in [`LogHistory`].
pub const HISTORY_CAPACITY: usize = 1_000;

/// Maximum number of distinct keys per aggregation dimension.
pub const GROUP_CAPACITY: usize = 100;

/// Size of the per-group ring buffer of recent entries.
pub const RECENT_LOGS_CAPACITY: usize = 10;

/// Default length of the preserve window after monitoring stops.
pub const DEFAULT_PRESERVE_SECS: u64 = 30;

// ============================================================================
// Entries
// ============================================================================

/// Direction of a logged connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
    #[default]
    Unknown,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
            Self::Unknown => UNKNOWN,
        }
    }

    /// Parses a direction token, falling back to `Unknown`.
    pub fn from_token(token: &str) -> Self {
        match token.to_ascii_lowercase().as_str() {
            "inbound" => Self::Inbound,
            "outbound" => Self::Outbound,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded diagnostic log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionLogEntry {
    pub session_id: String,
    pub domain: String,
    pub network_type: String,
    pub node_group: String,
    pub direction: Direction,
    pub delay: String,
    /// Log level reported by the core (`info`, `warning`, ...).
    #[serde(rename = "type")]
    pub log_type: String,
    pub payload: String,
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// Groups
// ============================================================================

/// The key an aggregation map is built on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GroupDimension {
    Domain,
    NetworkType,
    NodeGroup,
    Direction,
}

impl GroupDimension {
    pub const ALL: [GroupDimension; 4] = [
        Self::Domain,
        Self::NetworkType,
        Self::NodeGroup,
        Self::Direction,
    ];

    /// Extracts this dimension's key from an entry.
    pub fn key<'a>(&self, entry: &'a ConnectionLogEntry) -> &'a str {
        match self {
            Self::Domain => &entry.domain,
            Self::NetworkType => &entry.network_type,
            Self::NodeGroup => &entry.node_group,
            Self::Direction => entry.direction.as_str(),
        }
    }
}

/// Aggregation bucket for one key of one dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionGroup {
    pub name: String,
    pub count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub recent_logs: VecDeque<ConnectionLogEntry>,
    /// Recency stamp from the owning map's clock, used for eviction.
    #[serde(skip)]
    touched: u64,
}

impl ConnectionGroup {
    fn new(name: &str, entry: &ConnectionLogEntry, touched: u64) -> Self {
        let mut group = Self {
            name: name.to_string(),
            count: 0,
            first_seen: entry.timestamp,
            last_seen: entry.timestamp,
            recent_logs: VecDeque::with_capacity(RECENT_LOGS_CAPACITY),
            touched,
        };
        group.record(entry, touched);
        group
    }

    fn record(&mut self, entry: &ConnectionLogEntry, touched: u64) {
        self.count = self.count.saturating_add(1);
        self.last_seen = entry.timestamp;
        self.touched = touched;
        if self.recent_logs.len() >= RECENT_LOGS_CAPACITY {
            self.recent_logs.pop_front();
        }
        self.recent_logs.push_back(entry.clone());
    }
}

/// A single dimension's map, capped at [`GROUP_CAPACITY`] keys with
/// least-recently-seen eviction.
#[derive(Debug, Clone, Default)]
pub struct GroupMap {
    groups: HashMap<String, ConnectionGroup>,
    clock: u64,
}

impl GroupMap {
    pub fn record(&mut self, key: &str, entry: &ConnectionLogEntry) {
        self.clock = self.clock.wrapping_add(1);
        let clock = self.clock;

        if let Some(group) = self.groups.get_mut(key) {
            group.record(entry, clock);
            return;
        }

        if self.groups.len() >= GROUP_CAPACITY {
            let stalest = self
                .groups
                .iter()
                .min_by_key(|(_, group)| group.touched)
                .map(|(name, _)| name.clone());
            if let Some(name) = stalest {
                self.groups.remove(&name);
            }
        }

        self.groups
            .insert(key.to_string(), ConnectionGroup::new(key, entry, clock));
    }

    pub fn get(&self, key: &str) -> Option<&ConnectionGroup> {
        self.groups.get(key)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn clear(&mut self) {
        self.groups.clear();
        self.clock = 0;
    }

    /// Groups ordered by count, busiest first, ties broken by name.
    pub fn sorted(&self) -> Vec<ConnectionGroup> {
        let mut groups: Vec<ConnectionGroup> = self.groups.values().cloned().collect();
        groups.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
        groups
    }
}

/// The four parallel aggregation maps.
#[derive(Debug, Clone, Default)]
pub struct ConnectionGroups {
    domain: GroupMap,
    network_type: GroupMap,
    node_group: GroupMap,
    direction: GroupMap,
}

impl ConnectionGroups {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map(&self, dimension: GroupDimension) -> &GroupMap {
        match dimension {
            GroupDimension::Domain => &self.domain,
            GroupDimension::NetworkType => &self.network_type,
            GroupDimension::NodeGroup => &self.node_group,
            GroupDimension::Direction => &self.direction,
        }
    }

    fn map_mut(&mut self, dimension: GroupDimension) -> &mut GroupMap {
        match dimension {
            GroupDimension::Domain => &mut self.domain,
            GroupDimension::NetworkType => &mut self.network_type,
            GroupDimension::NodeGroup => &mut self.node_group,
            GroupDimension::Direction => &mut self.direction,
        }
    }

    /// Merges one entry into all four maps.
    pub fn record(&mut self, entry: &ConnectionLogEntry) {
        for dimension in GroupDimension::ALL {
            let key = dimension.key(entry);
            self.map_mut(dimension).record(key, entry);
        }
    }

    pub fn clear(&mut self) {
        for dimension in GroupDimension::ALL {
            self.map_mut(dimension).clear();
        }
    }

    pub fn snapshot(&self) -> GroupsSnapshot {
        GroupsSnapshot {
            domain: self.domain.sorted(),
            network_type: self.network_type.sorted(),
            node_group: self.node_group.sorted(),
            direction: self.direction.sorted(),
        }
    }
}

/// Serializable view of [`ConnectionGroups`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupsSnapshot {
    pub domain: Vec<ConnectionGroup>,
    pub network_type: Vec<ConnectionGroup>,
    pub node_group: Vec<ConnectionGroup>,
    pub direction: Vec<ConnectionGroup>,
}

// ============================================================================
// History
// ============================================================================

/// FIFO history of decoded entries, capped at [`HISTORY_CAPACITY`].
#[derive(Debug, Clone, Default)]
pub struct LogHistory {
    entries: VecDeque<ConnectionLogEntry>,
}

impl LogHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: ConnectionLogEntry) {
        if self.entries.len() >= HISTORY_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConnectionLogEntry> {
        self.entries.iter()
    }

    /// The newest `n` entries in arrival order.
    pub fn recent(&self, n: usize) -> Vec<ConnectionLogEntry> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).cloned().collect()
    }
}

// ============================================================================
// Monitoring State
// ============================================================================

/// Phase of the monitor's stream state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MonitorPhase {
    #[default]
    Idle,
    Connecting,
    Streaming,
    ClosedGraceful,
    ClosedError,
    Backoff,
    /// Retry ceiling reached; only an explicit enable leaves this phase.
    Disabled,
}

impl MonitorPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Streaming => "streaming",
            Self::ClosedGraceful => "closed-graceful",
            Self::ClosedError => "closed-error",
            Self::Backoff => "backoff",
            Self::Disabled => "disabled",
        }
    }
}

impl fmt::Display for MonitorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Monitor bookkeeping exposed to clients.
///
/// Invariant: `is_monitoring` implies a stream is connecting or open, or a
/// preserve window is active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringState {
    pub is_monitoring: bool,
    pub last_start_time: Option<DateTime<Utc>>,
    pub preserve_until: Option<DateTime<Utc>>,
    pub preserve_duration_secs: u64,
    pub pending_start: bool,
    pub start_request_id: u64,
}

impl Default for MonitoringState {
    fn default() -> Self {
        Self::with_preserve_secs(DEFAULT_PRESERVE_SECS)
    }
}

impl MonitoringState {
    pub fn with_preserve_secs(secs: u64) -> Self {
        Self {
            is_monitoring: false,
            last_start_time: None,
            preserve_until: None,
            preserve_duration_secs: secs,
            pending_start: false,
            start_request_id: 0,
        }
    }

    /// Returns true while `now` is inside the preserve window.
    pub fn is_preserving(&self, now: DateTime<Utc>) -> bool {
        self.preserve_until.map(|until| now < until).unwrap_or(false)
    }

    /// Opens a preserve window starting at `now` and returns its end.
    pub fn arm_preserve(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        let secs = i64::try_from(self.preserve_duration_secs).unwrap_or(i64::MAX);
        let until = now
            .checked_add_signed(Duration::seconds(secs))
            .unwrap_or(now);
        self.preserve_until = Some(until);
        until
    }

    pub fn clear_preserve(&mut self) {
        self.preserve_until = None;
    }

    /// Allocates a new start request id, superseding any in-flight one.
    pub fn next_request(&mut self) -> u64 {
        self.start_request_id = self.start_request_id.wrapping_add(1);
        self.start_request_id
    }
}

/// Everything a late-joining client needs to render the connection view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSnapshot {
    pub phase: MonitorPhase,
    pub monitoring: MonitoringState,
    pub groups: GroupsSnapshot,
    pub history_len: usize,
    pub recent: Vec<ConnectionLogEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(domain: &str) -> ConnectionLogEntry {
        ConnectionLogEntry {
            session_id: "1".to_string(),
            domain: domain.to_string(),
            network_type: "tcp".to_string(),
            node_group: "Proxy".to_string(),
            direction: Direction::Outbound,
            delay: UNKNOWN.to_string(),
            log_type: "info".to_string(),
            payload: String::new(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_history_is_fifo_and_bounded() {
        let mut history = LogHistory::new();
        for i in 0..(HISTORY_CAPACITY + 5) {
            history.push(entry(&format!("host{i}.example")));
        }
        assert_eq!(history.len(), HISTORY_CAPACITY);
        assert_eq!(
            history.iter().next().map(|e| e.domain.as_str()),
            Some("host5.example")
        );
        let recent = history.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].domain, format!("host{}.example", HISTORY_CAPACITY + 4));
    }

    #[test]
    fn test_recent_logs_ring_buffer() {
        let mut groups = ConnectionGroups::new();
        for _ in 0..25 {
            groups.record(&entry("example.com"));
        }
        let group = groups.map(GroupDimension::Domain).get("example.com").unwrap();
        assert_eq!(group.count, 25);
        assert_eq!(group.recent_logs.len(), RECENT_LOGS_CAPACITY);
    }

    #[test]
    fn test_group_map_evicts_least_recently_seen() {
        let mut groups = ConnectionGroups::new();
        for i in 0..GROUP_CAPACITY {
            groups.record(&entry(&format!("host{i}")));
        }
        // Touch host0 so host1 becomes the stalest key.
        groups.record(&entry("host0"));
        groups.record(&entry("newcomer"));

        let domains = groups.map(GroupDimension::Domain);
        assert_eq!(domains.len(), GROUP_CAPACITY);
        assert!(domains.get("host0").is_some());
        assert!(domains.get("host1").is_none());
        assert!(domains.get("newcomer").is_some());
    }

    #[test]
    fn test_all_dimensions_recorded() {
        let mut groups = ConnectionGroups::new();
        groups.record(&entry("a.com"));
        let snapshot = groups.snapshot();
        assert_eq!(snapshot.domain.len(), 1);
        assert_eq!(snapshot.network_type[0].name, "tcp");
        assert_eq!(snapshot.node_group[0].name, "Proxy");
        assert_eq!(snapshot.direction[0].name, "outbound");

        groups.clear();
        assert!(groups.map(GroupDimension::Domain).is_empty());
    }

    #[test]
    fn test_snapshot_sorted_by_count() {
        let mut groups = ConnectionGroups::new();
        groups.record(&entry("quiet.com"));
        groups.record(&entry("busy.com"));
        groups.record(&entry("busy.com"));
        let snapshot = groups.snapshot();
        assert_eq!(snapshot.domain[0].name, "busy.com");
        assert_eq!(snapshot.domain[1].name, "quiet.com");
    }

    #[test]
    fn test_preserve_window() {
        let mut state = MonitoringState::default();
        let now = Utc::now();
        assert!(!state.is_preserving(now));

        let until = state.arm_preserve(now);
        assert_eq!(until - now, Duration::seconds(30));
        assert!(state.is_preserving(now + Duration::seconds(29)));
        assert!(!state.is_preserving(now + Duration::seconds(30)));

        state.clear_preserve();
        assert!(!state.is_preserving(now));
    }

    #[test]
    fn test_request_ids_increase() {
        let mut state = MonitoringState::default();
        let first = state.next_request();
        let second = state.next_request();
        assert!(second > first);
        assert_eq!(state.start_request_id, second);
    }

    #[test]
    fn test_entry_serializes_type_field() {
        let json = serde_json::to_value(entry("x.com")).unwrap();
        assert_eq!(json["type"], "info");
        assert_eq!(json["direction"], "outbound");
        assert_eq!(json["sessionId"], "1");
    }
}
