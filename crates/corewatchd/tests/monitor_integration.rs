//! Integration tests for the connection monitor against a fake diagnostic API.
//!
//! Tests may use `.unwrap()` and `.expect()`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use corewatch_core::{ConnectionSnapshot, GlobalStatePatch, MonitorPhase, StateEventKind};
use corewatch_protocol::PresentationEvent;
use corewatchd::events::EventBus;
use corewatchd::extract::CoreConfigExtractor;
use corewatchd::monitor::{
    spawn_monitor, BackoffPolicy, MonitorContext, MonitorError, MonitorHandle, MonitorSettings,
};
use corewatchd::register::StateRegister;
use corewatchd::store::MemoryStore;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

const RULE_LINE: &str = r#"{"type":"info","payload":"[TCP] 127.0.0.1:52341 --> example.com:443 match DomainSuffix(example.com) using Proxy"}"#;
const SESSION_LINE: &str = r#"{"type":"info","payload":"[3572196284 12ms] outbound/vless[proxy-hk]: outbound connection to example.com:443"}"#;
const OTHER_LINE: &str = r#"{"type":"info","payload":"[TCP] 127.0.0.1:52342 --> other.org:80 match Match using DIRECT"}"#;

// ============================================================================
// Test Helpers
// ============================================================================

#[derive(Clone)]
enum Reply {
    /// Answer with an empty response of this status.
    Status(u16),
    /// Answer 200, write these lines, then hold the connection open.
    Stream(Vec<&'static str>),
}

/// A minimal HTTP/1.1 server standing in for the core's `/logs` endpoint.
/// Log lines go out as chunks of a never-ending chunked body.
struct FakeApi {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl FakeApi {
    async fn spawn(reply: Reply) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let api = Self {
            addr,
            accepted: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicUsize::new(0)),
            requests: Arc::new(Mutex::new(Vec::new())),
        };

        let accepted = api.accepted.clone();
        let closed = api.closed.clone();
        let requests = api.requests.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(
                    socket,
                    reply.clone(),
                    closed.clone(),
                    requests.clone(),
                ));
            }
        });
        api
    }

    fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

async fn serve(
    mut socket: TcpStream,
    reply: Reply,
    closed: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<String>>>,
) {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => head.extend_from_slice(&buf[..n]),
        }
    }
    requests
        .lock()
        .unwrap()
        .push(String::from_utf8_lossy(&head).to_string());

    match reply {
        Reply::Status(status) => {
            let response =
                format!("HTTP/1.1 {status} Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
            let _ = socket.write_all(response.as_bytes()).await;
        }
        Reply::Stream(lines) => {
            let _ = socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nTransfer-Encoding: chunked\r\n\r\n",
                )
                .await;
            for line in lines {
                let chunk = format!("{:x}\r\n{line}\n\r\n", line.len() + 1);
                let _ = socket.write_all(chunk.as_bytes()).await;
            }
            let _ = socket.flush().await;

            // Hold the stream until the client hangs up.
            let _ = socket.read(&mut buf).await;
            closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

struct Harness {
    _dir: TempDir,
    register: Arc<StateRegister>,
    events: EventBus,
    handle: MonitorHandle,
    shutdown: CancellationToken,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn settings(preserve_secs: u64) -> MonitorSettings {
    MonitorSettings {
        // Long enough that no reconnect fires during a test.
        backoff: BackoffPolicy {
            base: Duration::from_secs(60),
            multiplier: 2.0,
            max: Duration::from_secs(60),
        },
        preserve_secs,
        idle_timeout: Duration::from_secs(30),
    }
}

/// A register that already reports a running core whose configuration
/// points at `api`.
fn harness(api: &FakeApi, settings: MonitorSettings) -> Harness {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("config.yaml");
    std::fs::write(
        &config,
        format!(
            "mixed-port: 7890\nexternal-controller: {}\nsecret: s3cret\n",
            api.addr
        ),
    )
    .unwrap();

    let register = Arc::new(StateRegister::new(Arc::new(MemoryStore::new()), true));
    register.update(GlobalStatePatch::none().running(true).config_path(Some(config)));

    let events = EventBus::default();
    let shutdown = CancellationToken::new();
    let handle = spawn_monitor(
        settings,
        MonitorContext {
            register: register.clone(),
            extractor: Arc::new(CoreConfigExtractor),
            events: events.clone(),
            client: reqwest::Client::new(),
        },
        shutdown.clone(),
    );

    Harness {
        _dir: dir,
        register,
        events,
        handle,
        shutdown,
    }
}

async fn wait_for(
    handle: &MonitorHandle,
    mut condition: impl FnMut(&ConnectionSnapshot) -> bool,
) -> ConnectionSnapshot {
    timeout(WAIT, async {
        loop {
            let snapshot = handle.snapshot().await.unwrap();
            if condition(&snapshot) {
                return snapshot;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("monitor did not reach the expected state")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached");
}

// ============================================================================
// Streaming
// ============================================================================

#[tokio::test]
async fn test_records_are_decoded_and_grouped() {
    let api = FakeApi::spawn(Reply::Stream(vec![
        RULE_LINE,
        "this is not json",
        SESSION_LINE,
        "",
        OTHER_LINE,
    ]))
    .await;
    let h = harness(&api, settings(30));

    let status = h.handle.start().await.unwrap();
    assert!(status.monitoring.is_monitoring);

    let snapshot = wait_for(&h.handle, |s| s.history_len == 3).await;
    assert_eq!(snapshot.phase, MonitorPhase::Streaming);
    assert_eq!(snapshot.recent.len(), 3);

    let example = snapshot
        .groups
        .domain
        .iter()
        .find(|g| g.name == "example.com")
        .expect("example.com group");
    assert_eq!(example.count, 2);
    assert!(snapshot.groups.domain.iter().any(|g| g.name == "other.org"));
    assert!(snapshot.groups.node_group.iter().any(|g| g.name == "proxy-hk"));

    let request = api.requests.lock().unwrap()[0].to_ascii_lowercase();
    assert!(request.starts_with("get /logs?level=info "));
    assert!(request.contains("authorization: bearer s3cret"));

    // A successful open clears the retry history.
    let monitor = h.register.snapshot().connection_monitor;
    assert!(monitor.enabled);
    assert_eq!(monitor.retry_count, 0);
}

#[tokio::test]
async fn test_http_error_schedules_backoff() {
    let api = FakeApi::spawn(Reply::Status(500)).await;
    let h = harness(&api, settings(30));

    h.handle.start().await.unwrap();

    let snapshot = wait_for(&h.handle, |s| s.phase == MonitorPhase::Backoff).await;
    assert!(snapshot.monitoring.is_monitoring);
    assert_eq!(h.register.snapshot().connection_monitor.retry_count, 1);
    assert_eq!(api.accepted(), 1);
}

#[tokio::test]
async fn test_start_is_idempotent_while_streaming() {
    let api = FakeApi::spawn(Reply::Stream(vec![RULE_LINE])).await;
    let h = harness(&api, settings(30));

    h.handle.start().await.unwrap();
    wait_for(&h.handle, |s| s.phase == MonitorPhase::Streaming).await;

    h.handle.start().await.unwrap();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(api.accepted(), 1);
}

// ============================================================================
// Stop / Preserve Window
// ============================================================================

#[tokio::test]
async fn test_resume_within_preserve_window_keeps_stream() {
    let api = FakeApi::spawn(Reply::Stream(vec![RULE_LINE])).await;
    let h = harness(&api, settings(30));

    h.handle.start().await.unwrap();
    wait_for(&h.handle, |s| s.history_len == 1).await;

    let stopped = h.handle.stop().await.unwrap();
    assert!(!stopped.monitoring.is_monitoring);
    assert!(stopped.monitoring.preserve_until.is_some());
    assert!(!h.register.snapshot().connection_monitor.enabled);

    let mut rx = h.events.subscribe();
    let resumed = h.handle.start().await.unwrap();
    assert!(resumed.monitoring.is_monitoring);
    assert!(resumed.monitoring.preserve_until.is_none());

    let started = timeout(WAIT, async {
        loop {
            if let PresentationEvent::ConnectionMonitoringStarted { resumed } =
                rx.recv().await.unwrap()
            {
                return resumed;
            }
        }
    })
    .await
    .unwrap();
    assert!(started, "the preserved stream should be resumed");

    sleep(Duration::from_millis(200)).await;
    assert_eq!(api.accepted(), 1);
    assert_eq!(api.closed(), 0);

    // Resuming starts a fresh view.
    let snapshot = h.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.history_len, 0);
    assert_eq!(snapshot.phase, MonitorPhase::Streaming);
}

#[tokio::test]
async fn test_preserve_window_expiry_closes_stream() {
    let api = FakeApi::spawn(Reply::Stream(vec![RULE_LINE])).await;
    let h = harness(&api, settings(1));

    h.handle.start().await.unwrap();
    wait_for(&h.handle, |s| s.phase == MonitorPhase::Streaming).await;
    h.handle.stop().await.unwrap();

    wait_until(|| api.closed() == 1).await;
    let snapshot = wait_for(&h.handle, |s| s.phase == MonitorPhase::ClosedGraceful).await;
    assert!(snapshot.monitoring.preserve_until.is_none());
    assert!(!snapshot.monitoring.is_monitoring);
}

#[tokio::test]
async fn test_core_stop_closes_stream() {
    let api = FakeApi::spawn(Reply::Stream(vec![RULE_LINE])).await;
    let h = harness(&api, settings(30));

    h.handle.start().await.unwrap();
    wait_for(&h.handle, |s| s.phase == MonitorPhase::Streaming).await;

    h.register.update_with(
        StateEventKind::CoreStopped,
        GlobalStatePatch::none().running(false),
    );

    wait_until(|| api.closed() == 1).await;
    let snapshot = wait_for(&h.handle, |s| s.phase == MonitorPhase::ClosedGraceful).await;
    assert!(!snapshot.monitoring.is_monitoring);

    assert_eq!(h.handle.start().await, Err(MonitorError::CoreNotRunning));
}

#[tokio::test]
async fn test_core_stop_sequence_keeps_preserve_window() {
    let api = FakeApi::spawn(Reply::Stream(vec![RULE_LINE])).await;
    let h = harness(&api, settings(30));

    h.handle.start().await.unwrap();
    wait_for(&h.handle, |s| s.phase == MonitorPhase::Streaming).await;

    // A supervised stop announces core-stopping, then core-stopped on exit.
    h.register.notify(StateEventKind::CoreStopping);
    h.register.update_with(
        StateEventKind::CoreStopped,
        GlobalStatePatch::none().running(false),
    );

    wait_until(|| api.closed() == 1).await;
    let snapshot = wait_for(&h.handle, |s| s.phase == MonitorPhase::ClosedGraceful).await;
    assert!(!snapshot.monitoring.is_monitoring);
    assert!(
        snapshot.monitoring.preserve_until.is_some(),
        "core-stopped must not clear the window core-stopping armed"
    );

    // The core comes back and monitoring is re-enabled inside the window.
    h.register.update_with(
        StateEventKind::CoreStarted,
        GlobalStatePatch::none().running(true),
    );
    let mut rx = h.events.subscribe();
    h.handle.start().await.unwrap();

    let resumed = timeout(WAIT, async {
        loop {
            if let PresentationEvent::ConnectionMonitoringStarted { resumed } =
                rx.recv().await.unwrap()
            {
                return resumed;
            }
        }
    })
    .await
    .unwrap();
    assert!(resumed);
    wait_for(&h.handle, |s| s.phase == MonitorPhase::Streaming).await;
    assert_eq!(api.accepted(), 2);
}
