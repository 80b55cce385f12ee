use crate::registry::{SessionRecord, SessionStatus, StreamRecord};
use camlink_proto::{AgentStats, ConnectionState, StreamQuality};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Agent session as seen by the broker
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AgentInfo {
    /// Agent identity
    pub agent_id: String,
    /// Broker-side connection status
    pub status: SessionStatus,
    /// Time of the last registration
    pub connected_at: DateTime<Utc>,
    /// Time the last heartbeat was received
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// State the agent last reported
    pub reported_state: ConnectionState,
    /// Agent-side counters
    pub stats: AgentStats,
    pub capabilities: Vec<String>,
    /// Agent protocol version
    pub version: String,
    pub quality: StreamQuality,
    /// Relay port viewers connect to
    pub tunnel_port: u16,
    pub tunnel_active: bool,
    /// Malformed or out-of-order messages received
    pub protocol_violations: u64,
}

impl From<&SessionRecord> for AgentInfo {
    fn from(record: &SessionRecord) -> Self {
        Self {
            agent_id: record.agent_id.clone(),
            status: record.status,
            connected_at: record.connected_at,
            last_heartbeat: record.last_heartbeat,
            reported_state: record.reported_state,
            stats: record.stats.clone(),
            capabilities: record.capabilities.clone(),
            version: record.version.clone(),
            quality: record.quality,
            tunnel_port: record.tunnel_port,
            tunnel_active: record.tunnel_active,
            protocol_violations: record.protocol_violations,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AgentList {
    pub agents: Vec<AgentInfo>,
    pub total: usize,
}

/// Stream published by an agent
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StreamInfo {
    pub agent_id: String,
    /// URL viewers use to reach the relay
    pub url: String,
    pub quality: StreamQuality,
    pub active: bool,
    /// Open relay connections
    pub viewer_count: u32,
    pub frames_received: u64,
    pub bytes_received: u64,
    pub updated_at: DateTime<Utc>,
}

impl From<&StreamRecord> for StreamInfo {
    fn from(record: &StreamRecord) -> Self {
        Self {
            agent_id: record.agent_id.clone(),
            url: record.url.clone(),
            quality: record.quality,
            active: record.active,
            viewer_count: record.viewer_count,
            frames_received: record.frames_received,
            bytes_received: record.bytes_received,
            updated_at: record.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StreamList {
    pub streams: Vec<StreamInfo>,
    pub total: usize,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Service version
    pub version: String,
    pub total_agents: usize,
    pub connected_agents: usize,
    pub total_streams: usize,
    pub active_streams: usize,
    /// Open relay viewer connections
    pub viewers: u32,
}

/// Service summary served at `/`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    pub name: String,
    pub version: String,
    pub agents: usize,
    pub streams: usize,
}

/// Control command body
///
/// A known command object (`restart`, `get_status`, `update_config`,
/// `command`) is forwarded unchanged; any other object is wrapped as
/// `command{data}`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
#[schema(value_type = Object)]
pub struct ControlRequest(pub serde_json::Value);

/// Control command accepted for delivery
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ControlAccepted {
    pub agent_id: String,
    /// Wire type of the forwarded message
    pub command: String,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
    /// Error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}
