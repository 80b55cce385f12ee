//! REST query and control surface

use crate::error::BrokerError;
use crate::models::{
    AgentInfo, AgentList, ControlAccepted, ControlRequest, ErrorResponse, HealthResponse,
    ServiceInfo, StreamInfo, StreamList,
};
use crate::server::BrokerState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use camlink_proto::{ControlMessage, WireMessage};
use tracing::{debug, info, warn};
use utoipa::OpenApi;

type ApiError = (StatusCode, Json<ErrorResponse>);

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Camlink Broker API",
        description = "Query and control camera agents connected to the broker"
    ),
    paths(
        service_info,
        health_check,
        list_agents,
        get_agent,
        get_agent_stream,
        send_control,
        list_streams,
        openapi_json,
    ),
    components(
        schemas(
            crate::registry::SessionStatus,
            camlink_proto::ConnectionState,
            camlink_proto::StreamQuality,
            camlink_proto::AgentStats,
            AgentInfo,
            AgentList,
            StreamInfo,
            StreamList,
            HealthResponse,
            ServiceInfo,
            ControlRequest,
            ControlAccepted,
            ErrorResponse,
        )
    ),
    tags(
        (name = "agents", description = "Connected camera agents"),
        (name = "streams", description = "Relay streams published by agents"),
        (name = "system", description = "System health and info endpoints")
    )
)]
pub struct ApiDoc;

fn error_response(status: StatusCode, error: BrokerError) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            code: Some(error.code().to_string()),
        }),
    )
}

/// Turn a control body into the message sent to the agent
///
/// Operator commands pass through; every other object becomes `command{data}`.
pub fn control_message_from(value: serde_json::Value) -> Option<ControlMessage> {
    if !value.is_object() {
        return None;
    }
    match serde_json::from_value::<ControlMessage>(value.clone()) {
        Ok(message @ ControlMessage::Restart)
        | Ok(message @ ControlMessage::GetStatus)
        | Ok(message @ ControlMessage::UpdateConfig { .. })
        | Ok(message @ ControlMessage::Command { .. }) => Some(message),
        _ => Some(ControlMessage::Command { data: value }),
    }
}

/// Service summary
#[utoipa::path(
    get,
    path = "/",
    responses(
        (status = 200, description = "Service summary", body = ServiceInfo)
    ),
    tag = "system"
)]
pub async fn service_info(State(state): State<BrokerState>) -> Json<ServiceInfo> {
    let (agents, _) = state.registry.counts();
    let (streams, _, _) = state.streams.counts();

    Json(ServiceInfo {
        name: "camlink-broker".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        agents,
        streams,
    })
}

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_check(State(state): State<BrokerState>) -> Json<HealthResponse> {
    let (total_agents, connected_agents) = state.registry.counts();
    let (total_streams, active_streams, viewers) = state.streams.counts();

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        total_agents,
        connected_agents,
        total_streams,
        active_streams,
        viewers,
    })
}

/// List all known agents
#[utoipa::path(
    get,
    path = "/api/agents",
    responses(
        (status = 200, description = "List of agents", body = AgentList)
    ),
    tag = "agents"
)]
pub async fn list_agents(State(state): State<BrokerState>) -> Json<AgentList> {
    debug!("Listing agents");
    let agents: Vec<AgentInfo> = state.registry.list().iter().map(AgentInfo::from).collect();
    let total = agents.len();
    Json(AgentList { agents, total })
}

/// Get one agent
#[utoipa::path(
    get,
    path = "/api/agents/{id}",
    params(
        ("id" = String, Path, description = "Agent ID")
    ),
    responses(
        (status = 200, description = "Agent information", body = AgentInfo),
        (status = 404, description = "Agent not found", body = ErrorResponse)
    ),
    tag = "agents"
)]
pub async fn get_agent(
    State(state): State<BrokerState>,
    Path(id): Path<String>,
) -> Result<Json<AgentInfo>, ApiError> {
    state
        .registry
        .get(&id)
        .map(|record| Json(AgentInfo::from(&record)))
        .ok_or_else(|| error_response(StatusCode::NOT_FOUND, BrokerError::AgentNotFound(id)))
}

/// Get the stream published by an agent
#[utoipa::path(
    get,
    path = "/api/agents/{id}/stream",
    params(
        ("id" = String, Path, description = "Agent ID")
    ),
    responses(
        (status = 200, description = "Stream information", body = StreamInfo),
        (status = 404, description = "Stream not found", body = ErrorResponse)
    ),
    tag = "streams"
)]
pub async fn get_agent_stream(
    State(state): State<BrokerState>,
    Path(id): Path<String>,
) -> Result<Json<StreamInfo>, ApiError> {
    state
        .streams
        .get(&id)
        .map(|record| Json(StreamInfo::from(&record)))
        .ok_or_else(|| error_response(StatusCode::NOT_FOUND, BrokerError::StreamNotFound(id)))
}

/// Send a control command to a connected agent
#[utoipa::path(
    post,
    path = "/api/agents/{id}/control",
    params(
        ("id" = String, Path, description = "Agent ID")
    ),
    request_body = ControlRequest,
    responses(
        (status = 202, description = "Command queued for the agent", body = ControlAccepted),
        (status = 400, description = "Body is not a JSON object", body = ErrorResponse),
        (status = 404, description = "Agent not connected", body = ErrorResponse)
    ),
    tag = "agents"
)]
pub async fn send_control(
    State(state): State<BrokerState>,
    Path(id): Path<String>,
    Json(request): Json<ControlRequest>,
) -> Result<(StatusCode, Json<ControlAccepted>), ApiError> {
    let message = control_message_from(request.0).ok_or_else(|| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "Control body must be a JSON object".to_string(),
                code: Some("INVALID_COMMAND".to_string()),
            }),
        )
    })?;
    let command = message.type_name().to_string();

    if let Err(e) = state.connections.send(&id, message).await {
        warn!(agent_id = %id, command = %command, "Control command not delivered: {}", e);
        return Err(error_response(StatusCode::NOT_FOUND, e));
    }

    info!(agent_id = %id, command = %command, "Control command queued");
    Ok((
        StatusCode::ACCEPTED,
        Json(ControlAccepted {
            agent_id: id,
            command,
        }),
    ))
}

/// List all streams
#[utoipa::path(
    get,
    path = "/api/streams",
    responses(
        (status = 200, description = "List of streams", body = StreamList)
    ),
    tag = "streams"
)]
pub async fn list_streams(State(state): State<BrokerState>) -> Json<StreamList> {
    let streams: Vec<StreamInfo> = state.streams.list().iter().map(StreamInfo::from).collect();
    let total = streams.len();
    Json(StreamList { streams, total })
}

/// OpenAPI document
#[utoipa::path(
    get,
    path = "/api/openapi.json",
    responses(
        (status = 200, description = "OpenAPI document")
    ),
    tag = "system"
)]
pub async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
