//! Protocol message types for daemon communication.
//!
//! Every command a client sends gets exactly one response. Subscribed
//! clients additionally receive [`DaemonMessage::Event`] lines at any time.

use std::collections::HashMap;
use std::path::PathBuf;

use corewatch_core::{ConnectionSnapshot, CoreStatus, GlobalState, MonitorPhase, MonitoringState};
use serde::{Deserialize, Serialize};

use crate::event::PresentationEvent;
use crate::version::ProtocolVersion;

/// Message types that can be sent by clients to the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageType {
    /// Client handshake
    Connect {
        #[serde(skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },

    /// Receive presentation events on this connection
    Subscribe,

    Unsubscribe,

    Ping { seq: u64 },

    /// Client disconnecting gracefully
    Disconnect,

    /// Start the core. Without a path, the configured default is used.
    StartCore {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        config_path: Option<PathBuf>,
        /// User settings projected onto the runtime config (`allowLan`, ...)
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        overrides: HashMap<String, serde_json::Value>,
    },

    StopCore,

    RestartCore,

    GetStatus,

    StartMonitoring,

    StopMonitoring,

    ClearConnectionHistory,

    GetConnectionSnapshot,
}

impl MessageType {
    /// Short name used in logs and acknowledgements.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::Ping { .. } => "ping",
            Self::Disconnect => "disconnect",
            Self::StartCore { .. } => "start_core",
            Self::StopCore => "stop_core",
            Self::RestartCore => "restart_core",
            Self::GetStatus => "get_status",
            Self::StartMonitoring => "start_monitoring",
            Self::StopMonitoring => "stop_monitoring",
            Self::ClearConnectionHistory => "clear_connection_history",
            Self::GetConnectionSnapshot => "get_connection_snapshot",
        }
    }
}

/// Messages sent from client to daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMessage {
    pub protocol_version: ProtocolVersion,

    #[serde(flatten)]
    pub message: MessageType,
}

impl ClientMessage {
    /// Wraps a message with the current protocol version.
    pub fn new(message: MessageType) -> Self {
        Self {
            protocol_version: ProtocolVersion::CURRENT,
            message,
        }
    }

    pub fn connect(client_id: Option<String>) -> Self {
        Self::new(MessageType::Connect { client_id })
    }

    pub fn subscribe() -> Self {
        Self::new(MessageType::Subscribe)
    }

    pub fn ping(seq: u64) -> Self {
        Self::new(MessageType::Ping { seq })
    }

    pub fn disconnect() -> Self {
        Self::new(MessageType::Disconnect)
    }

    pub fn start_core(
        config_path: Option<PathBuf>,
        overrides: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self::new(MessageType::StartCore {
            config_path,
            overrides,
        })
    }
}

/// Messages sent from daemon to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonMessage {
    /// Handshake accepted
    Connected {
        protocol_version: ProtocolVersion,
        client_id: String,
    },

    /// Handshake rejected (version mismatch, etc.)
    Rejected {
        reason: String,
        protocol_version: ProtocolVersion,
    },

    Pong { seq: u64 },

    /// A command failed. `code` is the stable error kind.
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },

    /// Core spawned
    Started { pid: u32, port: u16 },

    /// Core stopped
    Stopped { message: String },

    Status {
        status: CoreStatus,
        state: Box<GlobalState>,
    },

    /// Result of a monitor start/stop/clear command
    Monitor {
        phase: MonitorPhase,
        monitoring: MonitoringState,
    },

    Snapshot { snapshot: Box<ConnectionSnapshot> },

    /// Generic acknowledgement for commands without a payload
    Ack { command: String },

    Event { event: PresentationEvent },
}

impl DaemonMessage {
    pub fn connected(client_id: String) -> Self {
        Self::Connected {
            protocol_version: ProtocolVersion::CURRENT,
            client_id,
        }
    }

    pub fn rejected(reason: &str) -> Self {
        Self::Rejected {
            reason: reason.to_string(),
            protocol_version: ProtocolVersion::CURRENT,
        }
    }

    pub fn error(message: &str) -> Self {
        Self::Error {
            message: message.to_string(),
            code: None,
        }
    }

    pub fn error_with_code(message: &str, code: &str) -> Self {
        Self::Error {
            message: message.to_string(),
            code: Some(code.to_string()),
        }
    }

    pub fn ack(command: &str) -> Self {
        Self::Ack {
            command: command.to_string(),
        }
    }

    pub fn event(event: PresentationEvent) -> Self {
        Self::Event { event }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_serialization() {
        let msg = ClientMessage::new(MessageType::StopMonitoring);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "stop_monitoring");
        assert_eq!(json["protocol_version"]["major"], 1);
    }

    #[test]
    fn test_start_core_defaults() {
        let json = r#"{"protocol_version":{"major":1,"minor":0},"type":"start_core"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        assert_eq!(
            msg.message,
            MessageType::StartCore {
                config_path: None,
                overrides: HashMap::new()
            }
        );
    }

    #[test]
    fn test_start_core_with_overrides() {
        let mut overrides = HashMap::new();
        overrides.insert("allowLan".to_string(), serde_json::Value::Bool(true));
        let original = ClientMessage::start_core(Some(PathBuf::from("/tmp/c.yaml")), overrides);
        let json = serde_json::to_string(&original).unwrap();
        let parsed: ClientMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_error_carries_code() {
        let msg = DaemonMessage::error_with_code("core binary missing", "not-installed");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "not-installed");
    }

    #[test]
    fn test_event_envelope() {
        let msg = DaemonMessage::event(PresentationEvent::ConnectionLogReset);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "event");
        assert_eq!(json["event"]["event"], "connection-log-reset");
    }
}
