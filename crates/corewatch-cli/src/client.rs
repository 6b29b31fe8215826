//! Daemon connection client.
//!
//! This module provides:
//! - [`DaemonClient`]: a handshaken connection that issues one command at a
//!   time and waits for its reply
//! - [`EventFollower`]: a subscribed connection that forwards presentation
//!   events and reconnects with exponential backoff when the daemon goes away
//!
//! **Panic-Free Policy:** No `.unwrap()`, `.expect()`, `panic!()`,
//! `unreachable!()`, or `todo!()` outside tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use corewatch_core::{ConnectionSnapshot, CoreStatus, GlobalState, MonitorPhase, MonitoringState};
use corewatch_protocol::{ClientMessage, DaemonMessage, MessageType, PresentationEvent, ProtocolVersion};

use crate::error::{CliError, Result};

/// Default daemon socket, matching the daemon's default.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/corewatch.sock";

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the daemon client.
///
/// # Example
///
/// ```rust
/// use corewatch_cli::client::ClientConfig;
/// use std::time::Duration;
///
/// let config = ClientConfig {
///     retry_initial_delay: Duration::from_millis(500),
///     ..ClientConfig::with_socket("/tmp/my-daemon.sock")
/// };
/// assert_eq!(config.next_delay(config.retry_initial_delay), Duration::from_secs(1));
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Path to the Unix socket where the daemon listens.
    pub socket_path: PathBuf,

    /// Client id sent in the handshake; the daemon assigns one if unset.
    pub client_id: Option<String>,

    /// How long to wait for a command's reply. Starting the core may first
    /// stop a running one, so this is generous.
    pub request_timeout: Duration,

    /// Initial delay before the first reconnect attempt.
    pub retry_initial_delay: Duration,

    /// Maximum delay between reconnect attempts.
    pub retry_max_delay: Duration,

    /// Multiplier for exponential backoff.
    pub retry_multiplier: f64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            client_id: None,
            request_timeout: Duration::from_secs(30),
            retry_initial_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
            retry_multiplier: 2.0,
        }
    }
}

impl ClientConfig {
    pub fn with_socket(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            ..Self::default()
        }
    }

    /// The reconnect delay that follows `current`.
    pub fn next_delay(&self, current: Duration) -> Duration {
        let multiplier = if self.retry_multiplier.is_finite() && self.retry_multiplier >= 1.0 {
            self.retry_multiplier
        } else {
            1.0
        };
        let next_ms = (current.as_millis() as f64 * multiplier) as u64;
        Duration::from_millis(next_ms).min(self.retry_max_delay)
    }
}

// ============================================================================
// Daemon Client
// ============================================================================

/// One handshaken connection to the daemon.
///
/// Commands are strictly request/response. Events that arrive while a
/// reply is awaited (on a subscribed connection) are skipped by
/// [`DaemonClient::request`]; use [`DaemonClient::next_event`] to read them.
pub struct DaemonClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    client_id: String,
    request_timeout: Duration,
}

impl DaemonClient {
    /// Connects to the daemon socket and performs the handshake.
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        let stream = UnixStream::connect(&config.socket_path)
            .await
            .map_err(|e| connect_error(&config.socket_path, e))?;
        let (reader, writer) = stream.into_split();

        let mut client = Self {
            reader: BufReader::new(reader),
            writer,
            client_id: String::new(),
            request_timeout: config.request_timeout,
        };
        client.handshake(config.client_id.clone()).await?;
        Ok(client)
    }

    /// Id the daemon knows this connection by.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn handshake(&mut self, client_id: Option<String>) -> Result<()> {
        self.send(&ClientMessage::connect(client_id)).await?;

        let limit = self.request_timeout;
        let response = timeout(limit, self.read_message())
            .await
            .map_err(|_| CliError::Timeout(limit))??;

        match response {
            DaemonMessage::Connected {
                protocol_version,
                client_id,
            } => {
                if !ProtocolVersion::CURRENT.is_compatible_with(&protocol_version) {
                    return Err(CliError::VersionMismatch {
                        client_version: ProtocolVersion::CURRENT.to_string(),
                        daemon_version: protocol_version.to_string(),
                    });
                }
                debug!(client_id, protocol_version = %protocol_version, "Handshake complete");
                self.client_id = client_id;
                Ok(())
            }
            DaemonMessage::Rejected {
                protocol_version, ..
            } => Err(CliError::VersionMismatch {
                client_version: ProtocolVersion::CURRENT.to_string(),
                daemon_version: protocol_version.to_string(),
            }),
            other => Err(unexpected("connect", &other)),
        }
    }

    async fn send(&mut self, message: &ClientMessage) -> Result<()> {
        let json = serde_json::to_string(message)?;
        self.writer.write_all(json.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        debug!(message_type = message.message.name(), "Sent message to daemon");
        Ok(())
    }

    async fn read_message(&mut self) -> Result<DaemonMessage> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(CliError::DaemonConnection(
                "daemon closed the connection".to_string(),
            ));
        }
        Ok(serde_json::from_str(line.trim())?)
    }

    /// Sends a command and returns its reply.
    ///
    /// A daemon `Error` reply becomes [`CliError::Command`].
    pub async fn request(&mut self, message: MessageType) -> Result<DaemonMessage> {
        let command = message.name();
        let limit = self.request_timeout;
        self.send(&ClientMessage::new(message)).await?;

        timeout(limit, self.await_reply(command))
            .await
            .map_err(|_| CliError::Timeout(limit))?
    }

    async fn await_reply(&mut self, command: &str) -> Result<DaemonMessage> {
        loop {
            match self.read_message().await? {
                DaemonMessage::Event { event } => {
                    debug!(event = event.name(), command, "Skipping event while awaiting reply");
                }
                DaemonMessage::Error { message, code } => {
                    return Err(CliError::Command { message, code });
                }
                reply => return Ok(reply),
            }
        }
    }

    pub async fn ping(&mut self, seq: u64) -> Result<()> {
        match self.request(MessageType::Ping { seq }).await? {
            DaemonMessage::Pong { seq: got } if got == seq => Ok(()),
            other => Err(unexpected("ping", &other)),
        }
    }

    /// Starts the core. Returns `(pid, port)`.
    pub async fn start_core(
        &mut self,
        config_path: Option<PathBuf>,
        overrides: HashMap<String, serde_json::Value>,
    ) -> Result<(u32, u16)> {
        let reply = self
            .request(MessageType::StartCore {
                config_path,
                overrides,
            })
            .await?;
        match reply {
            DaemonMessage::Started { pid, port } => Ok((pid, port)),
            other => Err(unexpected("start_core", &other)),
        }
    }

    pub async fn stop_core(&mut self) -> Result<String> {
        match self.request(MessageType::StopCore).await? {
            DaemonMessage::Stopped { message } => Ok(message),
            other => Err(unexpected("stop_core", &other)),
        }
    }

    pub async fn restart_core(&mut self) -> Result<(u32, u16)> {
        match self.request(MessageType::RestartCore).await? {
            DaemonMessage::Started { pid, port } => Ok((pid, port)),
            other => Err(unexpected("restart_core", &other)),
        }
    }

    pub async fn status(&mut self) -> Result<(CoreStatus, GlobalState)> {
        match self.request(MessageType::GetStatus).await? {
            DaemonMessage::Status { status, state } => Ok((status, *state)),
            other => Err(unexpected("get_status", &other)),
        }
    }

    pub async fn start_monitoring(&mut self) -> Result<(MonitorPhase, MonitoringState)> {
        self.monitor_command(MessageType::StartMonitoring).await
    }

    pub async fn stop_monitoring(&mut self) -> Result<(MonitorPhase, MonitoringState)> {
        self.monitor_command(MessageType::StopMonitoring).await
    }

    async fn monitor_command(
        &mut self,
        message: MessageType,
    ) -> Result<(MonitorPhase, MonitoringState)> {
        let command = message.name();
        match self.request(message).await? {
            DaemonMessage::Monitor { phase, monitoring } => Ok((phase, monitoring)),
            other => Err(unexpected(command, &other)),
        }
    }

    pub async fn clear_connection_history(&mut self) -> Result<()> {
        match self.request(MessageType::ClearConnectionHistory).await? {
            DaemonMessage::Ack { .. } => Ok(()),
            other => Err(unexpected("clear_connection_history", &other)),
        }
    }

    pub async fn connection_snapshot(&mut self) -> Result<ConnectionSnapshot> {
        match self.request(MessageType::GetConnectionSnapshot).await? {
            DaemonMessage::Snapshot { snapshot } => Ok(*snapshot),
            other => Err(unexpected("get_connection_snapshot", &other)),
        }
    }

    /// Subscribes this connection to presentation events.
    pub async fn subscribe(&mut self) -> Result<()> {
        match self.request(MessageType::Subscribe).await? {
            DaemonMessage::Ack { .. } => Ok(()),
            other => Err(unexpected("subscribe", &other)),
        }
    }

    /// Waits for the next event. `None` once the daemon hangs up.
    pub async fn next_event(&mut self) -> Result<Option<PresentationEvent>> {
        loop {
            let message = match self.read_message().await {
                Ok(message) => message,
                Err(CliError::DaemonConnection(_)) => return Ok(None),
                Err(e) => return Err(e),
            };
            match message {
                DaemonMessage::Event { event } => return Ok(Some(event)),
                other => debug!(message = ?other, "Ignoring non-event message"),
            }
        }
    }

    /// Tells the daemon this client is leaving.
    pub async fn disconnect(mut self) {
        if let Err(e) = self.send(&ClientMessage::disconnect()).await {
            debug!(error = %e, "Disconnect message not delivered");
        }
    }
}

fn connect_error(socket_path: &Path, e: std::io::Error) -> CliError {
    CliError::DaemonConnection(format!("{}: {e}", socket_path.display()))
}

fn unexpected(command: &str, reply: &DaemonMessage) -> CliError {
    CliError::ProtocolError(format!("Unexpected reply to {command}: {reply:?}"))
}

// ============================================================================
// Event Follower
// ============================================================================

/// What a follower reports to its caller.
#[derive(Debug, Clone, PartialEq)]
pub enum FollowUpdate {
    /// Subscribed (again) after connecting.
    Connected { client_id: String },
    Event(PresentationEvent),
    /// The daemon went away; a reconnect is pending.
    Disconnected,
}

/// Follows the daemon's event stream across daemon restarts.
pub struct EventFollower {
    config: ClientConfig,
    cancel_token: CancellationToken,
}

impl EventFollower {
    pub fn new(config: ClientConfig, cancel_token: CancellationToken) -> Self {
        Self {
            config,
            cancel_token,
        }
    }

    /// Runs until cancelled.
    ///
    /// Connection failures are retried indefinitely; a protocol version
    /// mismatch ends the follower with an error, since retrying cannot fix it.
    pub async fn run<F>(&self, mut on_update: F) -> Result<()>
    where
        F: FnMut(FollowUpdate),
    {
        info!(socket_path = %self.config.socket_path.display(), "Following daemon events");

        loop {
            let Some(mut client) = self.connect_with_retry().await? else {
                return Ok(());
            };
            on_update(FollowUpdate::Connected {
                client_id: client.client_id().to_string(),
            });

            loop {
                let next = tokio::select! {
                    _ = self.cancel_token.cancelled() => {
                        client.disconnect().await;
                        return Ok(());
                    }
                    next = client.next_event() => next,
                };
                match next {
                    Ok(Some(event)) => on_update(FollowUpdate::Event(event)),
                    Ok(None) => {
                        info!("Daemon closed connection");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Event stream ended with error");
                        break;
                    }
                }
            }

            on_update(FollowUpdate::Disconnected);
        }
    }

    /// Connects and subscribes, backing off between attempts.
    ///
    /// `Ok(None)` means cancelled.
    async fn connect_with_retry(&self) -> Result<Option<DaemonClient>> {
        let mut delay = self.config.retry_initial_delay;
        let mut attempt = 0u32;

        loop {
            attempt = attempt.saturating_add(1);

            let connected = async {
                let mut client = DaemonClient::connect(&self.config).await?;
                client.subscribe().await?;
                Ok::<_, CliError>(client)
            };

            match connected.await {
                Ok(client) => {
                    debug!(attempt, "Subscribed to daemon events");
                    return Ok(Some(client));
                }
                Err(e @ CliError::VersionMismatch { .. }) => return Err(e),
                Err(e) => {
                    if attempt == 1 {
                        warn!(error = %e, "Daemon not reachable, will retry");
                    } else {
                        debug!(attempt, error = %e, "Connection attempt failed");
                    }
                }
            }

            tokio::select! {
                _ = sleep(delay) => delay = self.config.next_delay(delay),
                _ = self.cancel_token.cancelled() => {
                    info!("Connection retry cancelled");
                    return Ok(None);
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
