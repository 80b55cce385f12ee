//! Protocol message types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Messages sent by an agent to the broker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    /// First message on a fresh connection
    Register {
        device_id: String,
        /// Preferred relay port; the broker may allocate a different one
        #[serde(default)]
        tunnel_port: Option<u16>,
        #[serde(default)]
        capabilities: Vec<String>,
        version: String,
        #[serde(default)]
        quality: StreamQuality,
    },
    /// Ask the broker to expose the local camera through the relay port
    CreateTunnel {
        device_id: String,
        camera_ip: String,
        camera_port: u16,
        tunnel_port: u16,
    },
    /// Fire-and-forget liveness signal
    Heartbeat {
        device_id: String,
        /// Agent wall clock, informational only
        timestamp: f64,
        status: ConnectionState,
        #[serde(default)]
        stats: Option<AgentStats>,
    },
    StreamData {
        device_id: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    StatusUpdate {
        status: ConnectionState,
        #[serde(default)]
        stats: Option<AgentStats>,
    },
    /// Answer to `get_status`
    Status {
        device_id: String,
        connected: bool,
        tunnel_active: bool,
        uptime: u64,
    },
    /// Camera bytes flowing back to a relay viewer
    RelayData {
        stream_id: u32,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    RelayClose {
        stream_id: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

/// Messages sent by the broker to an agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    RegistrationConfirmed {
        agent_id: String,
        stream_url: String,
        server_time: DateTime<Utc>,
        tunnel_port: u16,
    },
    TunnelCreated {
        device_id: String,
        tunnel_port: u16,
    },
    TunnelError {
        reason: String,
    },
    Restart,
    UpdateConfig {
        #[serde(default)]
        config: serde_json::Value,
    },
    GetStatus,
    /// Opaque operator command
    Command {
        #[serde(default)]
        data: serde_json::Value,
    },
    /// A viewer connected to the relay port
    RelayOpen {
        stream_id: u32,
    },
    /// Viewer bytes destined for the camera
    RelayData {
        stream_id: u32,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    RelayClose {
        stream_id: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl ControlMessage {
    /// Replies that complete a pending `register` / `create_tunnel` exchange
    pub fn is_handshake_reply(&self) -> bool {
        matches!(
            self,
            ControlMessage::RegistrationConfirmed { .. }
                | ControlMessage::TunnelCreated { .. }
                | ControlMessage::TunnelError { .. }
        )
    }
}

// JSON has no byte type; payloads travel as standard base64 strings
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Agent connection lifecycle state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Stopped,
    Starting,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Stopped => "stopped",
            ConnectionState::Starting => "starting",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requested stream quality
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum StreamQuality {
    Low,
    #[default]
    Medium,
    High,
}

impl StreamQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamQuality::Low => "low",
            StreamQuality::Medium => "medium",
            StreamQuality::High => "high",
        }
    }
}

/// Agent-side counters carried in heartbeats and status updates
///
/// Every counter is monotonic; `uptime_secs` is derived from the session start.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct AgentStats {
    #[serde(default)]
    pub bytes_sent: u64,
    #[serde(default)]
    pub bytes_received: u64,
    #[serde(default)]
    pub packets_lost: u64,
    /// Frames evicted or rejected by the outbound buffer
    #[serde(default)]
    pub frames_dropped: u64,
    #[serde(default)]
    pub reconnections: u64,
    #[serde(default)]
    pub uptime_secs: u64,
}
