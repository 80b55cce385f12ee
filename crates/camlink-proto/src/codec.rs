//! JSON text-frame codec with strict type checking

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::messages::{AgentMessage, ControlMessage};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Message has no type field")]
    MissingType,

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A message family that can travel in one direction of the channel
pub trait WireMessage: Sized {
    /// Every `type` discriminator this family accepts
    const KNOWN_TYPES: &'static [&'static str];

    fn type_name(&self) -> &'static str;
}

impl WireMessage for AgentMessage {
    const KNOWN_TYPES: &'static [&'static str] = &[
        "register",
        "create_tunnel",
        "heartbeat",
        "stream_data",
        "status_update",
        "status",
        "relay_data",
        "relay_close",
    ];

    fn type_name(&self) -> &'static str {
        match self {
            AgentMessage::Register { .. } => "register",
            AgentMessage::CreateTunnel { .. } => "create_tunnel",
            AgentMessage::Heartbeat { .. } => "heartbeat",
            AgentMessage::StreamData { .. } => "stream_data",
            AgentMessage::StatusUpdate { .. } => "status_update",
            AgentMessage::Status { .. } => "status",
            AgentMessage::RelayData { .. } => "relay_data",
            AgentMessage::RelayClose { .. } => "relay_close",
        }
    }
}

impl WireMessage for ControlMessage {
    const KNOWN_TYPES: &'static [&'static str] = &[
        "registration_confirmed",
        "tunnel_created",
        "tunnel_error",
        "restart",
        "update_config",
        "get_status",
        "command",
        "relay_open",
        "relay_data",
        "relay_close",
    ];

    fn type_name(&self) -> &'static str {
        match self {
            ControlMessage::RegistrationConfirmed { .. } => "registration_confirmed",
            ControlMessage::TunnelCreated { .. } => "tunnel_created",
            ControlMessage::TunnelError { .. } => "tunnel_error",
            ControlMessage::Restart => "restart",
            ControlMessage::UpdateConfig { .. } => "update_config",
            ControlMessage::GetStatus => "get_status",
            ControlMessage::Command { .. } => "command",
            ControlMessage::RelayOpen { .. } => "relay_open",
            ControlMessage::RelayData { .. } => "relay_data",
            ControlMessage::RelayClose { .. } => "relay_close",
        }
    }
}

/// Encodes and decodes messages as single JSON text frames
pub struct MessageCodec;

impl MessageCodec {
    pub fn encode<T: Serialize>(message: &T) -> Result<String, CodecError> {
        Ok(serde_json::to_string(message)?)
    }

    /// Decode a text frame, separating "not ours" from "ours but broken"
    ///
    /// A frame whose `type` is absent or not a string yields `MissingType`; a
    /// `type` outside [`WireMessage::KNOWN_TYPES`] yields `UnknownType`; a known
    /// type with missing or mistyped fields yields `Malformed`.
    pub fn decode<T>(text: &str) -> Result<T, CodecError>
    where
        T: WireMessage + DeserializeOwned,
    {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| CodecError::Malformed(e.to_string()))?;

        if !value.is_object() {
            return Err(CodecError::Malformed("expected a JSON object".to_string()));
        }

        let type_name = match value.get("type").and_then(|t| t.as_str()) {
            Some(t) => t.to_string(),
            None => return Err(CodecError::MissingType),
        };

        if !T::KNOWN_TYPES.contains(&type_name.as_str()) {
            return Err(CodecError::UnknownType(type_name));
        }

        serde_json::from_value(value).map_err(|e| CodecError::Malformed(e.to_string()))
    }
}
