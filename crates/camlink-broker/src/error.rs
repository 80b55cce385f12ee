use camlink_proto::CodecError;
use thiserror::Error;

/// Errors raised by the broker
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Agent {0} is not connected")]
    NotConnected(String),

    #[error("Agent {0} not found")]
    AgentNotFound(String),

    #[error("No stream for agent {0}")]
    StreamNotFound(String),

    #[error("No free relay port in {start}-{end}")]
    PortExhausted { start: u16, end: u16 },

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl BrokerError {
    /// Machine-readable code used in REST error bodies
    pub fn code(&self) -> &'static str {
        match self {
            BrokerError::NotConnected(_) => "AGENT_NOT_CONNECTED",
            BrokerError::AgentNotFound(_) => "AGENT_NOT_FOUND",
            BrokerError::StreamNotFound(_) => "STREAM_NOT_FOUND",
            BrokerError::PortExhausted { .. } => "PORT_EXHAUSTED",
            BrokerError::Bind { .. } => "BIND_FAILED",
            BrokerError::Codec(_) => "CODEC_ERROR",
            BrokerError::Io(_) => "IO_ERROR",
            BrokerError::Config(_) => "INVALID_CONFIG",
        }
    }
}
