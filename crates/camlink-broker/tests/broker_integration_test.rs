//! End-to-end tests: a real broker on loopback driven by the real agent channel

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use camlink_agent::{
    AgentConfig, AgentIdentity, AgentSession, CameraEndpoint, ChannelContext, HeartbeatPayload,
    IdentitySource, RelayChannel, SessionError, SessionStats, Timers, TunnelChannel,
};
use camlink_broker::{router, BrokerConfig, BrokerServer, BrokerState, SessionStatus};
use camlink_proto::{AgentStats, ConnectionState};
use serde_json::{json, Value};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

/// Route broker and agent logs through the test harness; `RUST_LOG` narrows them
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

struct TestBroker {
    addr: SocketAddr,
    state: BrokerState,
    shutdown: CancellationToken,
}

impl TestBroker {
    async fn start(config: BrokerConfig) -> Self {
        init_logging();
        let server = BrokerServer::bind(BrokerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            relay_bind_ip: "127.0.0.1".parse().unwrap(),
            relay_ports: None,
            public_host: "127.0.0.1".to_string(),
            ..config
        })
        .await
        .expect("Failed to bind broker");

        let addr = server.local_addr().unwrap();
        let state = server.state();
        let shutdown = CancellationToken::new();
        tokio::spawn(server.serve(shutdown.clone()));
        println!("🛰️  Broker listening on {}", addr);

        Self {
            addr,
            state,
            shutdown,
        }
    }

    fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Camera stand-in that echoes whatever the relay sends it
async fn echo_camera() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

fn identity(id: &str) -> AgentIdentity {
    AgentIdentity {
        id: id.to_string(),
        source: IdentitySource::Configured,
    }
}

fn agent_config(broker_url: String, camera: SocketAddr) -> AgentConfig {
    AgentConfig {
        broker_url,
        camera: CameraEndpoint {
            ip: camera.ip().to_string(),
            port: camera.port(),
        },
        timers: Timers {
            connection_timeout_secs: 5,
            reconnect_interval_secs: 1,
            heartbeat_interval_secs: 1,
            frame_interval_ms: 40,
        },
        ..Default::default()
    }
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("Timed out waiting for {}", what);
}

async fn post_control(state: &BrokerState, agent_id: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(format!("/api/agents/{}/control", agent_id))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = router(state.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn test_agent_registers_and_relays_viewer_traffic() {
    let broker = TestBroker::start(BrokerConfig::default()).await;
    let camera = echo_camera().await;

    let session = AgentSession::builder(identity("cam-01"), agent_config(broker.url(), camera))
        .build()
        .unwrap();
    session.start().await.expect("Agent failed to start");
    assert_eq!(session.state(), ConnectionState::Connected);

    let record = broker.state.registry.get("cam-01").unwrap();
    assert_eq!(record.status, SessionStatus::Connected);
    assert!(record.tunnel_active);
    let port = record.tunnel_port;
    println!("📡 Relay port for cam-01: {}", port);

    let status = session.status().await;
    assert_eq!(
        status.stream_url.as_deref(),
        Some(format!("rtsp://127.0.0.1:{}/cam-01", port).as_str())
    );

    // Viewer -> relay -> agent -> camera -> agent -> relay -> viewer
    let request: &[u8] = b"DESCRIBE rtsp://cam-01 RTSP/1.0\r\n\r\n";
    let mut viewer = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    viewer.write_all(request).await.unwrap();
    let mut buf = vec![0u8; 64];
    let mut received = Vec::new();
    while received.len() < request.len() {
        let n = timeout(Duration::from_secs(5), viewer.read(&mut buf))
            .await
            .expect("relay echo timed out")
            .unwrap();
        assert!(n > 0, "relay closed early");
        received.extend_from_slice(&buf[..n]);
    }
    assert_eq!(received, request);
    let state = &broker.state;
    assert_eq!(state.streams.get("cam-01").unwrap().viewer_count, 1);

    drop(viewer);
    eventually("viewer to detach", || async move {
        state.streams.get("cam-01").unwrap().viewer_count == 0
    })
    .await;

    // Frames pushed by the agent are attributed to its stream
    session.send(vec![0u8; 100]).await;
    session.send(vec![0u8; 50]).await;
    eventually("frames to arrive", || async move {
        state.streams.get("cam-01").unwrap().frames_received == 2
    })
    .await;
    assert_eq!(state.streams.get("cam-01").unwrap().bytes_received, 150);

    eventually("first heartbeat", || async move {
        state.registry.get("cam-01").unwrap().last_heartbeat.is_some()
    })
    .await;

    session.stop().await;
    eventually("broker to mark disconnect", || async move {
        state.registry.get("cam-01").unwrap().status == SessionStatus::Disconnected
    })
    .await;
    assert!(!state.streams.get("cam-01").unwrap().active);
    assert!(!state.connections.is_connected("cam-01").await);

    println!("✅ Registration, relay and disconnect verified");
}

#[tokio::test]
async fn test_restart_over_rest_reuses_relay_port() {
    let broker = TestBroker::start(BrokerConfig::default()).await;
    let camera = echo_camera().await;

    let session = AgentSession::builder(identity("cam-02"), agent_config(broker.url(), camera))
        .build()
        .unwrap();
    session.start().await.unwrap();

    let state = &broker.state;
    let first = state.registry.get("cam-02").unwrap();
    let first_id = first.connection_id;

    let (status, body) = post_control(&broker.state, "cam-02", json!({"type": "restart"})).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["command"], "restart");

    let agent = &session;
    eventually("agent to reconnect", || async move {
        agent.stats().reconnections == 1 && agent.state() == ConnectionState::Connected
    })
    .await;
    eventually("broker to see the new connection", || async move {
        state.registry.get("cam-02").unwrap().connection_id != first_id
    })
    .await;

    let second = state.registry.get("cam-02").unwrap();
    assert_eq!(second.status, SessionStatus::Connected);
    assert_eq!(second.tunnel_port, first.tunnel_port);

    // The old connection's close must not have flipped the new session
    sleep(Duration::from_millis(200)).await;
    assert_eq!(
        state.registry.get("cam-02").unwrap().status,
        SessionStatus::Connected
    );

    session.stop().await;
}

#[tokio::test]
async fn test_control_to_unconnected_agent_fails() {
    let broker = TestBroker::start(BrokerConfig::default()).await;
    let (status, body) = post_control(&broker.state, "ghost", json!({"type": "get_status"})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "AGENT_NOT_CONNECTED");
}

#[tokio::test]
async fn test_bearer_token_required() {
    let broker = TestBroker::start(BrokerConfig {
        auth_token: Some("fleet-secret".to_string()),
        ..Default::default()
    })
    .await;
    let camera = echo_camera().await;

    let rejected = AgentSession::builder(identity("cam-03"), agent_config(broker.url(), camera))
        .build()
        .unwrap();
    let result = rejected.start().await;
    assert!(matches!(result, Err(SessionError::Registration(_))));
    assert!(broker.state.registry.get("cam-03").is_none());

    let config = AgentConfig {
        auth_token: Some("fleet-secret".to_string()),
        ..agent_config(broker.url(), camera)
    };
    let accepted = AgentSession::builder(identity("cam-03"), config)
        .build()
        .unwrap();
    accepted.start().await.expect("Authorized agent should connect");
    assert!(broker.state.registry.get("cam-03").is_some());
    accepted.stop().await;
}

#[tokio::test]
async fn test_silent_agent_expires_and_heartbeat_revives() {
    let broker = TestBroker::start(BrokerConfig {
        heartbeat_interval_secs: 1,
        max_missed_heartbeats: 1,
        sweep_interval_secs: 1,
        ..Default::default()
    })
    .await;
    let camera = echo_camera().await;

    // Drive the channel by hand so no heartbeat is sent unless we say so
    let (commands, _command_rx) = mpsc::channel(16);
    let channel = RelayChannel::new(ChannelContext {
        identity: identity("cam-04"),
        config: agent_config(broker.url(), camera),
        commands,
        stats: Arc::new(SessionStats::new()),
    });
    let registration = channel.register().await.unwrap();
    assert_eq!(registration.agent_id, "cam-04");
    channel.establish().await.unwrap();

    let state = &broker.state;
    eventually("sweeper to expire the session", || async move {
        state.registry.get("cam-04").unwrap().status == SessionStatus::Disconnected
    })
    .await;
    assert!(!state.streams.get("cam-04").unwrap().active);

    let heartbeat = HeartbeatPayload {
        status: ConnectionState::Connected,
        stats: AgentStats {
            bytes_sent: 42,
            ..Default::default()
        },
    };
    channel.send_heartbeat(&heartbeat).await.unwrap();

    eventually("heartbeat to revive the session", || async move {
        let record = state.registry.get("cam-04").unwrap();
        record.status == SessionStatus::Connected && record.stats.bytes_sent == 42
    })
    .await;
    assert!(state.streams.get("cam-04").unwrap().active);

    channel.close().await.unwrap();
}
