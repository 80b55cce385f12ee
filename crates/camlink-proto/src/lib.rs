//! Camlink Protocol Definitions
//!
//! This crate defines the JSON wire messages exchanged between camera agents and
//! the cloud broker, plus the codec that turns text frames into closed, typed
//! message enums at the transport boundary.

pub mod codec;
pub mod messages;

pub use codec::{CodecError, MessageCodec, WireMessage};
pub use messages::*;

/// Protocol version announced in `register`
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Default relay port hint (matches the legacy agent's `-M 2956`)
pub const DEFAULT_TUNNEL_PORT: u16 = 2956;

/// Path prefix of the agent WebSocket endpoint; the device id follows it
pub const AGENT_PATH_PREFIX: &str = "/agent";

/// Capabilities announced by agents that do not override them
pub const DEFAULT_CAPABILITIES: [&str; 4] = ["rtsp", "tunnel", "h264", "h265"];
