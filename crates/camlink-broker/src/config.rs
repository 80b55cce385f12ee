//! Broker configuration

use crate::error::BrokerError;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Inclusive range of relay ports handed out to agents
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// HTTP + agent WebSocket listener
    pub bind_addr: SocketAddr,
    /// Host used when building stream URLs
    pub public_host: String,
    /// Interface relay listeners bind to
    pub relay_bind_ip: IpAddr,
    /// `None` lets the OS pick relay ports
    pub relay_ports: Option<PortRange>,
    pub heartbeat_interval_secs: u64,
    /// Consecutive missed heartbeats before a session is marked disconnected
    pub max_missed_heartbeats: u32,
    pub sweep_interval_secs: u64,
    /// Required as `Authorization: Bearer <token>` on agent connections
    pub auth_token: Option<String>,
    pub enable_cors: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8080),
            public_host: "localhost".to_string(),
            relay_bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            relay_ports: Some(PortRange {
                start: 8554,
                end: 8654,
            }),
            heartbeat_interval_secs: 30,
            max_missed_heartbeats: 2,
            sweep_interval_secs: 5,
            auth_token: None,
            enable_cors: true,
        }
    }
}

impl BrokerConfig {
    /// Receipt gap after which a session counts as gone
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs) * self.max_missed_heartbeats
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn validate(&self) -> Result<(), BrokerError> {
        if self.heartbeat_interval_secs == 0 {
            return Err(BrokerError::Config(
                "heartbeat interval must be greater than zero".to_string(),
            ));
        }
        if self.max_missed_heartbeats == 0 {
            return Err(BrokerError::Config(
                "max missed heartbeats must be greater than zero".to_string(),
            ));
        }
        if self.sweep_interval_secs == 0 {
            return Err(BrokerError::Config(
                "sweep interval must be greater than zero".to_string(),
            ));
        }
        if let Some(range) = self.relay_ports {
            if range.start == 0 || range.start > range.end {
                return Err(BrokerError::Config(format!(
                    "invalid relay port range {}-{}",
                    range.start, range.end
                )));
            }
        }
        if self.public_host.trim().is_empty() {
            return Err(BrokerError::Config("public host is required".to_string()));
        }
        Ok(())
    }
}
