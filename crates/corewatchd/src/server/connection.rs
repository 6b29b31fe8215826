//! Connection handler for individual client connections.
//!
//! Each client connection gets its own `ConnectionHandler` that:
//! - Performs protocol version negotiation
//! - Parses incoming messages
//! - Routes commands to the supervisor and the monitor
//! - Registers the client for presentation events on `Subscribe`
//!
//! # Panic-Free Guarantees
//!
//! No `.unwrap()` or `.expect()`. Connection errors are logged and end in a
//! graceful disconnect.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use corewatch_protocol::{ClientMessage, DaemonMessage, MessageType, ProtocolVersion};

use super::{DaemonContext, MAX_SUBSCRIBERS};
use crate::monitor::{MonitorError, MonitorStatus};
use crate::supervisor::{StartOutcome, StartRequest, SupervisorError};

/// Type alias for subscriber writer handle
pub type SubscriberWriter = Arc<Mutex<BufWriter<OwnedWriteHalf>>>;

/// A client receiving presentation events.
pub struct Subscriber {
    pub writer: SubscriberWriter,
}

/// Type alias for the subscribers map
pub type SubscribersMap = Arc<RwLock<HashMap<String, Subscriber>>>;

/// Maximum message size (1 MB)
const MAX_MESSAGE_SIZE: usize = 1_048_576;

/// Read timeout for idle connections (5 minutes)
const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Write timeout (10 seconds)
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

type ClientId = String;

/// Connection handler for a single client.
pub struct ConnectionHandler {
    reader: BufReader<OwnedReadHalf>,

    /// Shared with the event forwarder once subscribed
    writer: SubscriberWriter,

    context: DaemonContext,

    subscribers: SubscribersMap,

    /// Assigned after handshake
    client_id: Option<ClientId>,

    subscribed: bool,

    connection_number: u64,
}

impl ConnectionHandler {
    pub fn new(
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        context: DaemonContext,
        subscribers: SubscribersMap,
        connection_number: u64,
    ) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer: Arc::new(Mutex::new(BufWriter::new(writer))),
            context,
            subscribers,
            client_id: None,
            subscribed: false,
            connection_number,
        }
    }

    /// Performs the handshake, then serves messages until the connection
    /// closes. Returns the client id so the server can drop its
    /// subscription.
    pub async fn run(mut self) -> Option<ClientId> {
        debug!(connection = self.connection_number, "New client connected");

        match self.handle_handshake().await {
            Ok(()) => info!(client_id = ?self.client_id, "Client handshake completed"),
            Err(e) => {
                warn!(connection = self.connection_number, error = %e, "Handshake failed");
                return None;
            }
        }

        let client_id = self.client_id.clone();

        if let Err(e) = self.process_messages().await {
            debug!(client_id = ?self.client_id, error = %e, "Connection closed");
        }

        info!(client_id = ?self.client_id, "Client disconnected");
        client_id
    }

    async fn handle_handshake(&mut self) -> Result<(), ConnectionError> {
        let msg = self.read_message().await?;

        let client_version = msg.protocol_version;
        if !client_version.is_compatible_with(&ProtocolVersion::CURRENT) {
            warn!(
                client_version = %client_version,
                server_version = %ProtocolVersion::CURRENT,
                "Protocol version mismatch"
            );

            self.send_message(DaemonMessage::rejected(&format!(
                "Protocol version {} not compatible with server version {}",
                client_version,
                ProtocolVersion::CURRENT
            )))
            .await?;

            return Err(ConnectionError::VersionMismatch {
                client: client_version,
                server: ProtocolVersion::CURRENT,
            });
        }

        match msg.message {
            MessageType::Connect { client_id } => {
                let assigned_id =
                    client_id.unwrap_or_else(|| format!("client-{}", self.connection_number));
                self.client_id = Some(assigned_id.clone());
                self.send_message(DaemonMessage::connected(assigned_id)).await
            }
            other => {
                self.send_message(DaemonMessage::error("Expected Connect message for handshake"))
                    .await?;
                Err(ConnectionError::UnexpectedMessage(other.name().to_string()))
            }
        }
    }

    async fn process_messages(&mut self) -> Result<(), ConnectionError> {
        loop {
            // Subscribers may stay silent indefinitely.
            let msg = if self.subscribed {
                self.read_message().await
            } else {
                match timeout(READ_TIMEOUT, self.read_message()).await {
                    Ok(result) => result,
                    Err(_) => {
                        debug!(client_id = ?self.client_id, "Connection timed out");
                        return Err(ConnectionError::Timeout);
                    }
                }
            };

            let msg = match msg {
                Ok(msg) => msg,
                Err(ConnectionError::Eof) => {
                    debug!(client_id = ?self.client_id, "Client sent EOF");
                    return Ok(());
                }
                Err(ConnectionError::ParseError(e)) => {
                    warn!(client_id = ?self.client_id, error = %e, "Unparseable message");
                    self.send_message(DaemonMessage::error_with_code(&e, "parse-error"))
                        .await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            self.handle_message(msg).await?;
        }
    }

    async fn handle_message(&mut self, msg: ClientMessage) -> Result<(), ConnectionError> {
        let command = msg.message.name();
        debug!(client_id = ?self.client_id, command, "Handling command");

        let reply = match msg.message {
            MessageType::Connect { .. } => DaemonMessage::error("Already connected"),

            MessageType::Subscribe => self.subscribe().await,

            MessageType::Unsubscribe => {
                if let Some(ref client_id) = self.client_id {
                    self.subscribers.write().await.remove(client_id);
                }
                self.subscribed = false;
                debug!(client_id = ?self.client_id, "Client unsubscribed");
                DaemonMessage::ack(command)
            }

            MessageType::Ping { seq } => DaemonMessage::Pong { seq },

            MessageType::Disconnect => {
                debug!(client_id = ?self.client_id, "Client requested disconnect");
                return Err(ConnectionError::Eof);
            }

            MessageType::StartCore {
                config_path,
                overrides,
            } => {
                let request = StartRequest::new(config_path).with_overrides(overrides);
                started(self.context.supervisor.start(request).await)
            }

            MessageType::StopCore => match self.context.supervisor.stop().await {
                Ok(outcome) => DaemonMessage::Stopped {
                    message: outcome.message,
                },
                Err(e) => supervisor_error(&e),
            },

            MessageType::RestartCore => started(self.context.supervisor.restart().await),

            MessageType::GetStatus => DaemonMessage::Status {
                status: self.context.supervisor.get_status().await,
                state: Box::new(self.context.register.snapshot()),
            },

            MessageType::StartMonitoring => monitor_reply(self.context.monitor.start().await),

            MessageType::StopMonitoring => monitor_reply(self.context.monitor.stop().await),

            MessageType::ClearConnectionHistory => match self.context.monitor.clear_history().await {
                Ok(()) => DaemonMessage::ack(command),
                Err(e) => monitor_error(&e),
            },

            MessageType::GetConnectionSnapshot => match self.context.monitor.snapshot().await {
                Ok(snapshot) => DaemonMessage::Snapshot {
                    snapshot: Box::new(snapshot),
                },
                Err(e) => monitor_error(&e),
            },
        };

        self.send_message(reply).await
    }

    async fn subscribe(&mut self) -> DaemonMessage {
        let Some(client_id) = self.client_id.clone() else {
            return DaemonMessage::error("Must connect before subscribing");
        };

        let mut subs = self.subscribers.write().await;
        if subs.len() >= MAX_SUBSCRIBERS && !subs.contains_key(&client_id) {
            return DaemonMessage::error_with_code(
                &format!("Too many subscribers (max: {MAX_SUBSCRIBERS})"),
                "too-many-subscribers",
            );
        }
        subs.insert(
            client_id.clone(),
            Subscriber {
                writer: Arc::clone(&self.writer),
            },
        );
        self.subscribed = true;

        debug!(client_id = %client_id, "Client subscribed to events");
        DaemonMessage::ack("subscribe")
    }

    async fn read_message(&mut self) -> Result<ClientMessage, ConnectionError> {
        let mut line = String::new();

        let bytes_read = self
            .reader
            .read_line(&mut line)
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        if bytes_read == 0 {
            return Err(ConnectionError::Eof);
        }

        if line.len() > MAX_MESSAGE_SIZE {
            return Err(ConnectionError::MessageTooLarge {
                size: line.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        serde_json::from_str(&line).map_err(|e| ConnectionError::ParseError(e.to_string()))
    }

    async fn send_message(&self, msg: DaemonMessage) -> Result<(), ConnectionError> {
        let json =
            serde_json::to_string(&msg).map_err(|e| ConnectionError::ParseError(e.to_string()))?;

        let mut writer = self.writer.lock().await;

        match timeout(WRITE_TIMEOUT, async {
            writer.write_all(json.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
            Ok::<(), std::io::Error>(())
        })
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ConnectionError::Io(e.to_string())),
            Err(_) => Err(ConnectionError::WriteTimeout),
        }
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }
}

fn started(result: Result<StartOutcome, SupervisorError>) -> DaemonMessage {
    match result {
        Ok(outcome) => DaemonMessage::Started {
            pid: outcome.pid,
            port: outcome.port,
        },
        Err(e) => supervisor_error(&e),
    }
}

fn supervisor_error(e: &SupervisorError) -> DaemonMessage {
    warn!(kind = e.kind(), error = %e, "Core command failed");
    DaemonMessage::error_with_code(&e.to_string(), e.kind())
}

fn monitor_reply(result: Result<MonitorStatus, MonitorError>) -> DaemonMessage {
    match result {
        Ok(status) => DaemonMessage::Monitor {
            phase: status.phase,
            monitoring: status.monitoring,
        },
        Err(e) => monitor_error(&e),
    }
}

fn monitor_error(e: &MonitorError) -> DaemonMessage {
    DaemonMessage::error_with_code(&e.to_string(), e.kind())
}

/// Errors that can occur during connection handling.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Protocol version mismatch: client {client}, server {server}")]
    VersionMismatch {
        client: ProtocolVersion,
        server: ProtocolVersion,
    },

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection closed")]
    Eof,

    #[error("Read timeout")]
    Timeout,

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_display() {
        let err = ConnectionError::VersionMismatch {
            client: ProtocolVersion::new(2, 0),
            server: ProtocolVersion::new(1, 0),
        };
        assert!(err.to_string().contains("2.0"));
        assert!(err.to_string().contains("1.0"));
    }

    #[test]
    fn test_supervisor_errors_carry_kind() {
        let msg = supervisor_error(&SupervisorError::NoConfig);
        match msg {
            DaemonMessage::Error { code, .. } => assert_eq!(code.as_deref(), Some("config-invalid")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_monitor_errors_carry_kind() {
        let msg = monitor_error(&MonitorError::CoreNotRunning);
        assert_eq!(
            msg,
            DaemonMessage::error_with_code("Core is not running", "core-not-running")
        );
    }
}
