//! Agent configuration

use camlink_proto::{StreamQuality, DEFAULT_TUNNEL_PORT};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("heartbeat interval must be greater than zero")]
    ZeroHeartbeat,

    #[error("broker URL is required")]
    MissingBrokerUrl,

    #[error("invalid broker URL {0}: expected ws:// or wss://")]
    InvalidBrokerUrl(String),

    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),

    #[error("unknown connection mode: {0}")]
    UnknownMode(String),
}

/// How the agent reaches the broker
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    /// Server-relayed, works behind arbitrary NAT
    #[default]
    Tunnel,
    P2p,
    /// P2P first, tunnel on any failure
    Hybrid,
}

impl FromStr for ConnectionMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tunnel" => Ok(ConnectionMode::Tunnel),
            "p2p" => Ok(ConnectionMode::P2p),
            "hybrid" => Ok(ConnectionMode::Hybrid),
            other => Err(ConfigError::UnknownMode(other.to_string())),
        }
    }
}

impl std::fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionMode::Tunnel => "tunnel",
            ConnectionMode::P2p => "p2p",
            ConnectionMode::Hybrid => "hybrid",
        };
        f.write_str(name)
    }
}

/// Local camera the relay forwards to
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CameraEndpoint {
    pub ip: String,
    pub port: u16,
}

impl Default for CameraEndpoint {
    fn default() -> Self {
        Self {
            ip: "127.0.0.1".to_string(),
            port: 554,
        }
    }
}

impl CameraEndpoint {
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct P2pConfig {
    pub enabled: bool,
    pub registry_url: Option<String>,
    pub stun_servers: Vec<String>,
    pub turn_servers: Vec<String>,
    /// Cap on one P2P attempt in hybrid mode before falling back to the relay
    pub negotiation_timeout_secs: u64,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            registry_url: None,
            stun_servers: Vec::new(),
            turn_servers: Vec::new(),
            negotiation_timeout_secs: 10,
        }
    }
}

impl P2pConfig {
    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs)
    }
}

/// Session timers, in whole seconds (frame cadence in milliseconds)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Timers {
    pub connection_timeout_secs: u64,
    pub reconnect_interval_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub frame_interval_ms: u64,
}

impl Default for Timers {
    fn default() -> Self {
        Self {
            connection_timeout_secs: 30,
            reconnect_interval_secs: 10,
            heartbeat_interval_secs: 30,
            frame_interval_ms: 40,
        }
    }
}

impl Timers {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }
}

/// What happens when a frame arrives at a full buffer
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict from the front until the new frame fits
    #[default]
    DropOldest,
    /// Keep the buffer as is and discard the incoming frame
    RejectNew,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BufferConfig {
    pub max_frames: usize,
    pub max_bytes: usize,
    pub overflow: OverflowPolicy,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_frames: 256,
            max_bytes: 1024 * 1024,
            overflow: OverflowPolicy::DropOldest,
        }
    }
}

/// Configuration for one agent session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Explicit identity; wins over every derived source
    pub device_id: Option<String>,
    pub mode: ConnectionMode,
    /// Broker WebSocket base URL, e.g. `ws://broker:8080`
    pub broker_url: String,
    pub auth_token: Option<String>,
    /// Relay port hint sent with `register`
    pub tunnel_port: u16,
    pub camera: CameraEndpoint,
    pub quality: StreamQuality,
    pub p2p: P2pConfig,
    pub timers: Timers,
    pub buffer: BufferConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            device_id: None,
            mode: ConnectionMode::Tunnel,
            broker_url: "ws://localhost:8080".to_string(),
            auth_token: None,
            tunnel_port: DEFAULT_TUNNEL_PORT,
            camera: CameraEndpoint::default(),
            quality: StreamQuality::Medium,
            p2p: P2pConfig::default(),
            timers: Timers::default(),
            buffer: BufferConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timers.heartbeat_interval_secs == 0 {
            return Err(ConfigError::ZeroHeartbeat);
        }

        let url = self.broker_url.trim();
        if url.is_empty() {
            return Err(ConfigError::MissingBrokerUrl);
        }
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(ConfigError::InvalidBrokerUrl(url.to_string()));
        }

        if self.timers.connection_timeout_secs == 0 {
            return Err(ConfigError::ZeroValue("connection timeout"));
        }
        if self.timers.frame_interval_ms == 0 {
            return Err(ConfigError::ZeroValue("frame interval"));
        }
        if self.p2p.enabled && self.p2p.negotiation_timeout_secs == 0 {
            return Err(ConfigError::ZeroValue("p2p negotiation timeout"));
        }
        if self.buffer.max_frames == 0 {
            return Err(ConfigError::ZeroValue("buffer max_frames"));
        }
        if self.buffer.max_bytes == 0 {
            return Err(ConfigError::ZeroValue("buffer max_bytes"));
        }

        Ok(())
    }
}
