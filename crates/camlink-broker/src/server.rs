//! Broker server: shared state, HTTP/WebSocket router and liveness sweeper

use crate::api;
use crate::config::BrokerConfig;
use crate::connection::AgentConnectionManager;
use crate::error::BrokerError;
use crate::handler::serve_agent;
use crate::models::ErrorResponse;
use crate::registry::{AgentRegistry, StreamRegistry};
use crate::relay::{EphemeralPortAllocator, PortAllocator, RangePortAllocator, RelayManager};
use axum::{
    extract::{ws::WebSocketUpgrade, Path, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};

/// State shared by every connection handler and REST handler
#[derive(Clone)]
pub struct BrokerState {
    pub config: Arc<BrokerConfig>,
    pub registry: AgentRegistry,
    pub streams: StreamRegistry,
    pub connections: AgentConnectionManager,
    pub relays: RelayManager,
}

impl BrokerState {
    pub fn new(config: BrokerConfig) -> Self {
        let registry = AgentRegistry::new();
        let streams = StreamRegistry::new();
        let connections = AgentConnectionManager::new();

        let allocator: Arc<dyn PortAllocator> = match config.relay_ports {
            Some(range) => Arc::new(RangePortAllocator::new(config.relay_bind_ip, range)),
            None => Arc::new(EphemeralPortAllocator::default()),
        };
        let relays = RelayManager::new(
            config.relay_bind_ip,
            allocator,
            connections.clone(),
            streams.clone(),
        );

        Self {
            config: Arc::new(config),
            registry,
            streams,
            connections,
            relays,
        }
    }
}

fn authorized(config: &BrokerConfig, headers: &HeaderMap) -> bool {
    let Some(expected) = config.auth_token.as_deref() else {
        return true;
    };
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .is_some_and(|token| token == expected)
}

async fn agent_socket(
    State(state): State<BrokerState>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !authorized(&state.config, &headers) {
        warn!(agent_id = %agent_id, "Rejected agent connection with invalid credentials");
        return (
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse {
                error: "Invalid or missing bearer token".to_string(),
                code: Some("UNAUTHORIZED".to_string()),
            }),
        )
            .into_response();
    }

    debug!(agent_id = %agent_id, "Upgrading agent connection");
    ws.on_upgrade(move |socket| serve_agent(state, agent_id, socket))
}

/// Build the router with all routes
pub fn router(state: BrokerState) -> Router {
    let enable_cors = state.config.enable_cors;

    let mut router = Router::new()
        .route("/", get(api::service_info))
        .route("/health", get(api::health_check))
        .route("/agent/{agent_id}", get(agent_socket))
        .route("/api/agents", get(api::list_agents))
        .route("/api/agents/{id}", get(api::get_agent))
        .route("/api/agents/{id}/stream", get(api::get_agent_stream))
        .route("/api/agents/{id}/control", post(api::send_control))
        .route("/api/streams", get(api::list_streams))
        .route("/api/openapi.json", get(api::openapi_json))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if enable_cors {
        router = router.layer(
            CorsLayer::new()
                .allow_methods([Method::GET, Method::POST])
                .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
                .allow_origin(Any),
        );
    }

    router
}

/// Periodically mark silent sessions disconnected and their streams inactive
pub fn spawn_sweeper(state: BrokerState, cancel: CancellationToken) -> JoinHandle<()> {
    let timeout = state.config.liveness_timeout();
    let mut ticker = tokio::time::interval(state.config.sweep_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    for agent_id in state.registry.expire_stale(timeout) {
                        state.streams.set_active(&agent_id, false);
                    }
                }
            }
        }
        debug!("Liveness sweeper stopped");
    })
}

pub struct BrokerServer {
    listener: TcpListener,
    state: BrokerState,
}

impl BrokerServer {
    /// Validate the config and bind the HTTP listener
    pub async fn bind(config: BrokerConfig) -> Result<Self, BrokerError> {
        config.validate()?;
        let listener =
            TcpListener::bind(config.bind_addr)
                .await
                .map_err(|source| BrokerError::Bind {
                    addr: config.bind_addr.to_string(),
                    source,
                })?;

        Ok(Self {
            listener,
            state: BrokerState::new(config),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, BrokerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn state(&self) -> BrokerState {
        self.state.clone()
    }

    /// Serve until `shutdown` is cancelled
    pub async fn serve(self, shutdown: CancellationToken) -> Result<(), BrokerError> {
        let addr = self.local_addr()?;
        info!("Broker listening on {}", addr);
        info!("Agents connect to ws://{}/agent/{{device_id}}", addr);
        info!("OpenAPI spec: http://{}/api/openapi.json", addr);

        let sweeper = spawn_sweeper(self.state.clone(), shutdown.child_token());
        let app = router(self.state.clone());

        let signal = shutdown.clone();
        let result = axum::serve(self.listener, app)
            .with_graceful_shutdown(async move { signal.cancelled().await })
            .await;

        shutdown.cancel();
        let _ = sweeper.await;
        info!("Broker stopped");

        result.map_err(BrokerError::Io)
    }
}
