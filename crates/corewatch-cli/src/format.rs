//! Plain-text rendering of daemon replies and events for the terminal.

use chrono::{DateTime, Utc};

use corewatch_core::{
    ConnectionGroup, ConnectionLogEntry, ConnectionSnapshot, CoreStatus, GlobalState, MonitorPhase,
    MonitoringState, UNKNOWN,
};
use corewatch_protocol::{OutputStream, PresentationEvent};

/// Compact duration: `42s`, `3m 05s`, `2h 07m`, `3d 04h`.
pub fn format_duration(duration: chrono::Duration) -> String {
    let secs = duration.num_seconds().max(0);
    let (days, hours, mins, secs) = (secs / 86_400, secs / 3_600 % 24, secs / 60 % 60, secs % 60);
    if days > 0 {
        format!("{days}d {hours:02}h")
    } else if hours > 0 {
        format!("{hours}h {mins:02}m")
    } else if mins > 0 {
        format!("{mins}m {secs:02}s")
    } else {
        format!("{secs}s")
    }
}

/// Multi-line summary for `corewatch status`.
pub fn format_status(status: &CoreStatus, state: &GlobalState, now: DateTime<Utc>) -> String {
    let mut lines = Vec::new();

    if status.is_running {
        let pids: Vec<String> = status.pids.iter().map(u32::to_string).collect();
        lines.push(format!("core:     running (pid {})", pids.join(", ")));
    } else {
        lines.push("core:     stopped".to_string());
    }
    if state.is_running != status.is_running {
        lines.push(format!(
            "          daemon state says {}",
            if state.is_running { "running" } else { "stopped" }
        ));
    }
    if let Some(path) = &state.config_path {
        lines.push(format!("config:   {}", path.display()));
    }
    if let (true, Some(start)) = (state.is_running, state.start_time) {
        lines.push(format!("uptime:   {}", format_duration(now - start)));
    }
    if let Some(error) = &state.last_error {
        lines.push(format!("error:    {error}"));
    }

    let monitor = &state.connection_monitor;
    lines.push(format!(
        "monitor:  {} (retries {}/{})",
        if monitor.enabled { "enabled" } else { "disabled" },
        monitor.retry_count,
        monitor.max_retries
    ));

    lines.join("\n")
}

/// One line for the result of a monitor command.
pub fn format_monitor(phase: MonitorPhase, monitoring: &MonitoringState) -> String {
    match (monitoring.is_monitoring, monitoring.preserve_until) {
        (true, _) => format!("monitor: {phase}, delivering"),
        (false, Some(until)) => format!(
            "monitor: {phase}, paused until {}",
            until.format("%H:%M:%S")
        ),
        (false, None) => format!("monitor: {phase}, off"),
    }
}

fn format_groups(title: &str, groups: &[ConnectionGroup], top: usize) -> Vec<String> {
    if groups.is_empty() {
        return Vec::new();
    }
    let mut sorted: Vec<&ConnectionGroup> = groups.iter().collect();
    sorted.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));

    let mut lines = vec![format!("{title}:")];
    lines.extend(
        sorted
            .into_iter()
            .take(top)
            .map(|g| format!("  {:>6}  {}", g.count, g.name)),
    );
    lines
}

/// Summary for `corewatch monitor snapshot`, listing the `top` busiest
/// groups per dimension.
pub fn format_snapshot(snapshot: &ConnectionSnapshot, top: usize) -> String {
    let mut lines = vec![
        format_monitor(snapshot.phase, &snapshot.monitoring),
        format!("history: {} entries", snapshot.history_len),
    ];
    lines.extend(format_groups("domains", &snapshot.groups.domain, top));
    lines.extend(format_groups("networks", &snapshot.groups.network_type, top));
    lines.extend(format_groups("node groups", &snapshot.groups.node_group, top));
    lines.extend(format_groups("directions", &snapshot.groups.direction, top));
    lines.join("\n")
}

fn format_entry(entry: &ConnectionLogEntry) -> String {
    let mut line = format!("[{}] {}", entry.direction.as_str(), entry.domain);
    if entry.node_group != UNKNOWN {
        line.push_str(&format!(" via {}", entry.node_group));
    }
    if entry.network_type != UNKNOWN {
        line.push_str(&format!(" ({})", entry.network_type));
    }
    if entry.delay != UNKNOWN {
        line.push_str(&format!(" {}", entry.delay));
    }
    line
}

/// One line per event for `corewatch follow`. Group snapshots are not
/// printed; they repeat what the log lines already show.
pub fn format_event(event: &PresentationEvent) -> Option<String> {
    let line = match event {
        PresentationEvent::CoreStarted { config_path, .. } => match config_path {
            Some(path) => format!("core started ({})", path.display()),
            None => "core started".to_string(),
        },
        PresentationEvent::CoreStopping => "core stopping".to_string(),
        PresentationEvent::CoreStopped => "core stopped".to_string(),
        PresentationEvent::StatusChanged { is_running } => {
            format!("status: {}", if *is_running { "running" } else { "stopped" })
        }
        PresentationEvent::CoreOutput { stream, line } => match stream {
            OutputStream::Stdout => format!("core | {line}"),
            OutputStream::Stderr => format!("core ! {line}"),
        },
        PresentationEvent::CoreExited(report) => {
            let how = match (report.code, report.signal) {
                (Some(code), _) => format!("code {code}"),
                (None, Some(signal)) => format!("signal {signal}"),
                (None, None) => "unknown status".to_string(),
            };
            match (&report.error, report.is_crash()) {
                (Some(error), true) => format!("core crashed (pid {}, {how}): {error}", report.pid),
                _ => format!("core exited (pid {}, {how})", report.pid),
            }
        }
        PresentationEvent::ConnectionMonitoringStarted { resumed } => {
            if *resumed {
                "monitoring resumed".to_string()
            } else {
                "monitoring started".to_string()
            }
        }
        PresentationEvent::ConnectionMonitoringStopped { preserve_until } => match preserve_until {
            Some(until) => format!("monitoring stopped, stream kept until {}", until.format("%H:%M:%S")),
            None => "monitoring stopped".to_string(),
        },
        PresentationEvent::ConnectionLog { entry } => format_entry(entry),
        PresentationEvent::ConnectionGroups { .. } => return None,
        PresentationEvent::ConnectionLogReset => "connection log cleared".to_string(),
        PresentationEvent::ConnectionMonitoringFailed { retries, reason } => {
            format!("monitoring disabled after {retries} retries: {reason}")
        }
    };
    Some(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use corewatch_core::{decode_entry, ConnectionGroups, ExitReport};

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(chrono::Duration::seconds(42)), "42s");
        assert_eq!(format_duration(chrono::Duration::seconds(185)), "3m 05s");
        assert_eq!(format_duration(chrono::Duration::seconds(7_620)), "2h 07m");
        assert_eq!(format_duration(chrono::Duration::seconds(273_600)), "3d 04h");
        assert_eq!(format_duration(chrono::Duration::seconds(-5)), "0s");
    }

    #[test]
    fn test_format_status_running() {
        let now = Utc::now();
        let status = CoreStatus::from_pids(vec![42]);
        let state = GlobalState {
            is_running: true,
            start_time: Some(now - chrono::Duration::seconds(65)),
            config_path: Some("/etc/mihomo/config.yaml".into()),
            ..GlobalState::default()
        };

        let text = format_status(&status, &state, now);
        assert!(text.contains("running (pid 42)"));
        assert!(text.contains("/etc/mihomo/config.yaml"));
        assert!(text.contains("uptime:   1m 05s"));
        assert!(text.contains("monitor:  disabled (retries 0/5)"));
        assert!(!text.contains("daemon state says"));
    }

    #[test]
    fn test_format_status_reports_disagreement_and_error() {
        let state = GlobalState {
            is_running: true,
            last_error: Some("fatal: bad config".to_string()),
            ..GlobalState::default()
        };
        let text = format_status(&CoreStatus::from_pids(Vec::new()), &state, Utc::now());
        assert!(text.starts_with("core:     stopped"));
        assert!(text.contains("daemon state says running"));
        assert!(text.contains("error:    fatal: bad config"));
    }

    #[test]
    fn test_format_snapshot_orders_groups_by_count() {
        let now = Utc::now();
        let mut groups = ConnectionGroups::new();
        for payload in [
            "[TCP] 127.0.0.1:1 --> a.com:443 match Match using Proxy",
            "[TCP] 127.0.0.1:2 --> b.com:443 match Match using Proxy",
            "[TCP] 127.0.0.1:3 --> b.com:443 match Match using Proxy",
        ] {
            groups.record(&decode_entry("info", payload, now));
        }
        let snapshot = ConnectionSnapshot {
            phase: MonitorPhase::Streaming,
            monitoring: MonitoringState {
                is_monitoring: true,
                ..MonitoringState::default()
            },
            groups: groups.snapshot(),
            history_len: 3,
            recent: Vec::new(),
        };

        let text = format_snapshot(&snapshot, 1);
        assert!(text.contains("monitor: streaming, delivering"));
        assert!(text.contains("history: 3 entries"));
        assert!(text.contains("2  b.com"));
        assert!(!text.contains("a.com"));
    }

    #[test]
    fn test_format_events() {
        let entry = decode_entry(
            "info",
            "[3572196284 12ms] outbound/vless[proxy-hk]: outbound connection to example.com:443",
            Utc::now(),
        );
        assert_eq!(
            format_event(&PresentationEvent::ConnectionLog {
                entry: Box::new(entry)
            })
            .unwrap(),
            "[outbound] example.com via proxy-hk (vless) 12ms"
        );

        let crash = PresentationEvent::CoreExited(ExitReport {
            pid: 7,
            code: Some(1),
            signal: None,
            requested: false,
            error: Some("fatal: bad config".to_string()),
        });
        assert_eq!(
            format_event(&crash).unwrap(),
            "core crashed (pid 7, code 1): fatal: bad config"
        );

        assert!(format_event(&PresentationEvent::ConnectionGroups {
            groups: ConnectionGroups::new().snapshot()
        })
        .is_none());
    }
}
