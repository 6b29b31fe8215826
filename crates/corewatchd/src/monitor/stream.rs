//! One connection to the core's streaming `/logs` endpoint.
//!
//! A stream task reports back to the monitor actor with [`StreamMessage`]s,
//! each tagged with the [`ConnectionToken`] it was started with. The actor
//! ignores messages whose token is no longer current, so a superseded
//! connection can never change monitor state.

use std::fmt;
use std::time::Duration;

use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use corewatch_protocol::RawLogRecord;

use super::codec::LogLineCodec;
use super::commands::MonitorCommand;
use crate::extract::ExtractedConfig;

/// Generation tag carried by every asynchronous monitor path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionToken(pub u64);

impl ConnectionToken {
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for ConnectionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Why a stream closed with an error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("diagnostic API unreachable: {0}")]
    ApiUnreachable(String),

    #[error("diagnostic API returned HTTP {status}")]
    ApiHttpError { status: u16 },

    #[error("log stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("no log data for {0:?}")]
    IdleTimeout(Duration),
}

impl StreamError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ApiUnreachable(_) => "api-unreachable",
            Self::ApiHttpError { .. } => "api-http-error",
            Self::StreamInterrupted(_) | Self::IdleTimeout(_) => "stream-interrupted",
        }
    }
}

/// Where the diagnostic API lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEndpoint {
    /// `http://host:port`
    pub base_url: String,
    pub secret: Option<String>,
}

impl StreamEndpoint {
    pub fn new(base_url: impl Into<String>, secret: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            secret,
        }
    }

    pub fn from_extracted(config: &ExtractedConfig) -> Option<Self> {
        Some(Self::new(config.api_base_url()?, config.secret.clone()))
    }

    pub fn logs_url(&self) -> String {
        format!("{}/logs?level=info", self.base_url.trim_end_matches('/'))
    }
}

/// Progress reports from a stream task.
#[derive(Debug)]
pub enum StreamMessage {
    /// The API answered 200; records follow.
    Opened { token: ConnectionToken },
    Record {
        token: ConnectionToken,
        record: RawLogRecord,
    },
    /// Always the last message of a stream. `Ok` means it was cancelled.
    Closed {
        token: ConnectionToken,
        result: Result<(), StreamError>,
    },
}

/// Runs one stream until it fails or `cancel` fires.
pub async fn run_stream(
    client: reqwest::Client,
    endpoint: StreamEndpoint,
    token: ConnectionToken,
    idle_timeout: Duration,
    cancel: CancellationToken,
    sink: mpsc::Sender<MonitorCommand>,
) {
    debug!(%token, url = %endpoint.logs_url(), "Opening log stream");
    let result = tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        result = stream_records(&client, &endpoint, token, idle_timeout, &sink) => result,
    };
    debug!(%token, ?result, "Log stream closed");
    let _ = sink
        .send(MonitorCommand::Stream(StreamMessage::Closed { token, result }))
        .await;
}

async fn stream_records(
    client: &reqwest::Client,
    endpoint: &StreamEndpoint,
    token: ConnectionToken,
    idle_timeout: Duration,
    sink: &mpsc::Sender<MonitorCommand>,
) -> Result<(), StreamError> {
    let mut request = client.get(endpoint.logs_url());
    if let Some(secret) = &endpoint.secret {
        request = request.bearer_auth(secret);
    }

    let response = timeout(idle_timeout, request.send())
        .await
        .map_err(|_| StreamError::ApiUnreachable(format!("no response within {idle_timeout:?}")))?
        .map_err(|e| StreamError::ApiUnreachable(e.to_string()))?;

    let status = response.status();
    if status != reqwest::StatusCode::OK {
        return Err(StreamError::ApiHttpError {
            status: status.as_u16(),
        });
    }

    if sink
        .send(MonitorCommand::Stream(StreamMessage::Opened { token }))
        .await
        .is_err()
    {
        return Ok(());
    }

    let body = response
        .bytes_stream()
        .map(|chunk| chunk.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)));
    let mut lines = FramedRead::new(StreamReader::new(Box::pin(body)), LogLineCodec::new());

    loop {
        let next = timeout(idle_timeout, lines.next())
            .await
            .map_err(|_| StreamError::IdleTimeout(idle_timeout))?;

        match next {
            Some(Ok(line)) => match RawLogRecord::parse_line(&line) {
                Some(record) => {
                    let message = MonitorCommand::Stream(StreamMessage::Record { token, record });
                    if sink.send(message).await.is_err() {
                        return Ok(());
                    }
                }
                None => trace!(%token, "Dropping malformed log line"),
            },
            Some(Err(e)) => return Err(StreamError::StreamInterrupted(e.to_string())),
            None => return Err(StreamError::StreamInterrupted("stream ended".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logs_url() {
        let endpoint = StreamEndpoint::new("http://127.0.0.1:9090/", None);
        assert_eq!(endpoint.logs_url(), "http://127.0.0.1:9090/logs?level=info");
    }

    #[test]
    fn test_endpoint_requires_api_address() {
        let config = ExtractedConfig {
            port: 7890,
            api_address: None,
            secret: None,
        };
        assert!(StreamEndpoint::from_extracted(&config).is_none());

        let config = ExtractedConfig {
            port: 7890,
            api_address: Some("127.0.0.1:9090".to_string()),
            secret: Some("s3cret".to_string()),
        };
        let endpoint = StreamEndpoint::from_extracted(&config).unwrap();
        assert_eq!(endpoint.base_url, "http://127.0.0.1:9090");
        assert_eq!(endpoint.secret.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(StreamError::ApiHttpError { status: 500 }.kind(), "api-http-error");
        assert_eq!(
            StreamError::IdleTimeout(Duration::from_secs(30)).kind(),
            "stream-interrupted"
        );
        assert_eq!(StreamError::ApiUnreachable("refused".into()).kind(), "api-unreachable");
    }
}
