//! Transport to the broker
//!
//! [`TunnelChannel`] is the capability set the session drives. Three variants
//! exist: [`RelayChannel`] (broker-relayed, always reachable), [`P2pChannel`]
//! (direct, via an injected negotiator) and [`HybridChannel`], which composes
//! the other two.
//!
//! Channels never retry. Any failure during `register`/`establish` is returned
//! once and the session decides what happens next.

mod hybrid;
mod p2p;
mod tunnel;

pub use hybrid::HybridChannel;
pub use p2p::{P2pChannel, P2pNegotiator, PeerLink, UnavailableNegotiator};
pub use tunnel::RelayChannel;
pub(crate) use tunnel::Outbound;

use crate::config::{AgentConfig, ConnectionMode};
use crate::identity::AgentIdentity;
use crate::stats::SessionStats;
use async_trait::async_trait;
use camlink_proto::{AgentStats, CodecError, ConnectionState, ControlMessage};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("channel closed")]
    Closed,

    #[error("channel not connected")]
    NotConnected,

    #[error("send queue full")]
    Backpressure,

    #[error("rejected by broker: {0}")]
    Rejected(String),

    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("P2P negotiation failed: {0}")]
    Negotiation(String),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Tunnel,
    P2p,
    Hybrid,
}

/// What the broker (or rendezvous registry) assigned on registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub agent_id: String,
    pub stream_url: String,
    pub tunnel_port: u16,
    pub server_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct HeartbeatPayload {
    pub status: ConnectionState,
    pub stats: AgentStats,
}

/// Answer to a `get_status` query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusReport {
    pub connected: bool,
    pub tunnel_active: bool,
    pub uptime_secs: u64,
}

#[async_trait]
pub trait TunnelChannel: Send + Sync {
    fn kind(&self) -> ChannelKind;

    async fn register(&self) -> Result<Registration, ChannelError>;

    /// Deadline for `register` + `establish` given the per-connection timeout
    fn setup_budget(&self, connection_timeout: Duration) -> Duration {
        connection_timeout
    }

    async fn establish(&self) -> Result<(), ChannelError>;

    /// Fire-and-forget; no acknowledgement is awaited
    async fn send_heartbeat(&self, heartbeat: &HeartbeatPayload) -> Result<(), ChannelError>;

    async fn send_stream_data(&self, frame: &[u8]) -> Result<(), ChannelError>;

    async fn send_status_update(&self, update: &HeartbeatPayload) -> Result<(), ChannelError>;

    async fn send_status(&self, report: &StatusReport) -> Result<(), ChannelError>;

    fn is_connected(&self) -> bool;

    /// Whether stream data can flow
    fn tunnel_active(&self) -> bool;

    async fn close(&self) -> Result<(), ChannelError>;
}

/// Everything a channel needs from its session
#[derive(Clone)]
pub struct ChannelContext {
    pub identity: AgentIdentity,
    pub config: AgentConfig,
    /// Broker commands (`restart`, `get_status`, ...) are delivered here
    pub commands: mpsc::Sender<ControlMessage>,
    pub stats: Arc<SessionStats>,
}

/// Builds a fresh channel for every connect attempt
pub trait ChannelFactory: Send + Sync {
    fn create(&self, ctx: ChannelContext) -> Arc<dyn TunnelChannel>;
}

/// Chooses the variant from `AgentConfig::mode`
pub struct DefaultChannelFactory {
    negotiator: Arc<dyn P2pNegotiator>,
}

impl Default for DefaultChannelFactory {
    fn default() -> Self {
        Self {
            negotiator: Arc::new(UnavailableNegotiator),
        }
    }
}

impl DefaultChannelFactory {
    pub fn with_negotiator(negotiator: Arc<dyn P2pNegotiator>) -> Self {
        Self { negotiator }
    }
}

impl ChannelFactory for DefaultChannelFactory {
    fn create(&self, ctx: ChannelContext) -> Arc<dyn TunnelChannel> {
        match ctx.config.mode {
            ConnectionMode::Tunnel => Arc::new(RelayChannel::new(ctx)),
            ConnectionMode::P2p => Arc::new(P2pChannel::new(ctx, self.negotiator.clone())),
            ConnectionMode::Hybrid => {
                let p2p: Option<Arc<dyn TunnelChannel>> = if ctx.config.p2p.enabled {
                    Some(Arc::new(P2pChannel::new(
                        ctx.clone(),
                        self.negotiator.clone(),
                    )))
                } else {
                    None
                };
                let p2p_timeout = ctx.config.p2p.negotiation_timeout();
                Arc::new(
                    HybridChannel::new(p2p, Arc::new(RelayChannel::new(ctx)))
                        .with_p2p_timeout(p2p_timeout),
                )
            }
        }
    }
}
