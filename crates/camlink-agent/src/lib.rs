//! Device-side agent for camlink
//!
//! Resolves a stable device identity, registers with the broker and keeps a
//! tunnel to the local camera alive through heartbeats, buffered retries and
//! reconnects.
//!
//! # Example
//!
//! ```no_run
//! use camlink_agent::{AgentConfig, AgentSession, IdentityResolver};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AgentConfig {
//!     broker_url: "ws://broker.example.com:8080".to_string(),
//!     ..Default::default()
//! };
//! let identity = IdentityResolver::new(config.device_id.clone()).resolve().await;
//! let session = AgentSession::builder(identity, config).build()?;
//! session.start().await?;
//! // ...
//! session.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod channel;
pub mod config;
pub mod forwarder;
pub mod identity;
pub mod session;
pub mod source;
pub mod stats;

pub use buffer::{OutboundBuffer, PushOutcome};
pub use channel::{
    ChannelContext, ChannelError, ChannelFactory, ChannelKind, DefaultChannelFactory,
    HeartbeatPayload, HybridChannel, P2pChannel, P2pNegotiator, PeerLink, Registration,
    RelayChannel, StatusReport, TunnelChannel, UnavailableNegotiator,
};
pub use config::{
    AgentConfig, BufferConfig, CameraEndpoint, ConfigError, ConnectionMode, OverflowPolicy,
    P2pConfig, Timers,
};
pub use forwarder::{CameraForwarder, ForwardError};
pub use identity::{
    AgentIdentity, ArmbenvIdentity, IdentityError, IdentityResolver, IdentitySource,
    PlatformIdentity,
};
pub use session::{AgentSession, AgentSessionBuilder, SessionError, SessionStatus};
pub use source::{IdleSource, PlatformError, PlatformInit, StreamSource};
pub use stats::SessionStats;
