//! Cloud broker for camlink agents
//!
//! Accepts one WebSocket per agent at `/agent/{device_id}`, keeps the session
//! and stream registries, relays viewer TCP traffic through the agent link and
//! exposes a REST surface for queries and control commands.

pub mod api;
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod models;
pub mod registry;
pub mod relay;
pub mod server;

pub use api::ApiDoc;
pub use config::{BrokerConfig, PortRange};
pub use connection::AgentConnectionManager;
pub use error::BrokerError;
pub use handler::{serve_agent, ConnectionHandler};
pub use registry::{
    AgentRegistry, HeartbeatOutcome, NewSession, SessionRecord, SessionStatus, StreamRecord,
    StreamRegistry,
};
pub use relay::{EphemeralPortAllocator, PortAllocator, RangePortAllocator, RelayManager};
pub use server::{router, spawn_sweeper, BrokerServer, BrokerState};
