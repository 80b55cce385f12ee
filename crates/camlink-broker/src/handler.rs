//! Per-connection agent protocol handling
//!
//! Every accepted WebSocket gets one [`ConnectionHandler`] that reads frames
//! sequentially and a writer task draining its outbound queue.

use crate::registry::{HeartbeatOutcome, NewSession};
use crate::server::BrokerState;
use axum::extract::ws::{Message, WebSocket};
use camlink_proto::{AgentMessage, ControlMessage, MessageCodec};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, info_span, warn, Instrument};

const OUTBOUND_QUEUE: usize = 256;

pub struct ConnectionHandler {
    state: BrokerState,
    agent_id: String,
    connection_id: u64,
    outbound: mpsc::Sender<ControlMessage>,
    registered: bool,
    tunnel_created: bool,
}

impl ConnectionHandler {
    pub fn new(
        state: BrokerState,
        agent_id: String,
        outbound: mpsc::Sender<ControlMessage>,
    ) -> Self {
        let connection_id = state.connections.next_connection_id();
        Self {
            state,
            agent_id,
            connection_id,
            outbound,
            registered: false,
            tunnel_created: false,
        }
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Decode and dispatch one text frame; bad frames are counted and skipped
    pub async fn handle_text(&mut self, text: &str) {
        match MessageCodec::decode::<AgentMessage>(text) {
            Ok(message) => self.handle_message(message).await,
            Err(e) => self.protocol_violation(&e.to_string()),
        }
    }

    pub async fn handle_message(&mut self, message: AgentMessage) {
        match message {
            AgentMessage::Register {
                device_id,
                tunnel_port,
                capabilities,
                version,
                quality,
            } => {
                if device_id != self.agent_id {
                    warn!(
                        device_id = %device_id,
                        "Registered device id differs from connection path, using path id"
                    );
                }

                let port = match self
                    .state
                    .relays
                    .reserve(&self.agent_id, self.connection_id, tunnel_port)
                    .await
                {
                    Ok(port) => port,
                    Err(e) => {
                        error!("Failed to reserve relay port: {}", e);
                        self.reply(ControlMessage::TunnelError {
                            reason: e.to_string(),
                        })
                        .await;
                        return;
                    }
                };

                let stream_url = format!(
                    "rtsp://{}:{}/{}",
                    self.state.config.public_host, port, self.agent_id
                );
                self.state.registry.register(NewSession {
                    agent_id: self.agent_id.clone(),
                    connection_id: self.connection_id,
                    capabilities,
                    version,
                    quality,
                    tunnel_port: port,
                });
                self.state.streams.upsert(
                    &self.agent_id,
                    self.connection_id,
                    stream_url.clone(),
                    quality,
                );
                self.state
                    .connections
                    .register(&self.agent_id, self.connection_id, self.outbound.clone())
                    .await;

                self.registered = true;
                self.tunnel_created = false;
                self.reply(ControlMessage::RegistrationConfirmed {
                    agent_id: self.agent_id.clone(),
                    stream_url,
                    server_time: Utc::now(),
                    tunnel_port: port,
                })
                .await;
            }
            AgentMessage::CreateTunnel {
                camera_ip,
                camera_port,
                tunnel_port,
                ..
            } => {
                if !self.registered {
                    self.protocol_violation("create_tunnel before register");
                    self.reply(ControlMessage::TunnelError {
                        reason: "agent is not registered".to_string(),
                    })
                    .await;
                    return;
                }

                match self.state.relays.open(&self.agent_id).await {
                    Ok(port) => {
                        if port != tunnel_port {
                            debug!(requested = tunnel_port, port, "Agent asked for a different relay port");
                        }
                        self.state.registry.mark_tunnel(&self.agent_id, true);
                        self.tunnel_created = true;
                        info!(
                            camera = %format!("{}:{}", camera_ip, camera_port),
                            tunnel_port = port,
                            "Tunnel created"
                        );
                        self.reply(ControlMessage::TunnelCreated {
                            device_id: self.agent_id.clone(),
                            tunnel_port: port,
                        })
                        .await;
                    }
                    Err(e) => {
                        warn!("Failed to open relay: {}", e);
                        self.reply(ControlMessage::TunnelError {
                            reason: e.to_string(),
                        })
                        .await;
                    }
                }
            }
            AgentMessage::Heartbeat { status, stats, .. } => {
                if !self.registered {
                    self.protocol_violation("heartbeat before register");
                    return;
                }
                match self.state.registry.heartbeat(
                    &self.agent_id,
                    self.connection_id,
                    status,
                    stats,
                ) {
                    HeartbeatOutcome::Updated => {
                        debug!(status = %status, "Heartbeat received");
                    }
                    HeartbeatOutcome::Revived => {
                        self.state.streams.set_active(&self.agent_id, true);
                        if self.tunnel_created {
                            self.state.registry.mark_tunnel(&self.agent_id, true);
                        }
                    }
                    HeartbeatOutcome::Stale => {
                        debug!("Heartbeat from superseded connection ignored");
                    }
                }
            }
            AgentMessage::StreamData { data, .. } => {
                if !self.tunnel_created {
                    self.protocol_violation("stream_data before tunnel_created");
                    return;
                }
                if !self
                    .state
                    .streams
                    .record_frame(&self.agent_id, self.connection_id, data.len())
                {
                    debug!("Stream data from superseded connection ignored");
                }
            }
            AgentMessage::StatusUpdate { status, stats } => {
                if !self.registered {
                    self.protocol_violation("status_update before register");
                    return;
                }
                if !self.state.registry.merge_status(
                    &self.agent_id,
                    self.connection_id,
                    status,
                    stats,
                ) {
                    debug!("Status update from superseded connection ignored");
                }
            }
            AgentMessage::Status {
                connected,
                tunnel_active,
                uptime,
                ..
            } => {
                info!(connected, tunnel_active, uptime, "Agent status report");
            }
            AgentMessage::RelayData { stream_id, data } => {
                if !self
                    .state
                    .relays
                    .deliver(&self.agent_id, stream_id, data)
                    .await
                {
                    debug!(stream_id, "Relay data for unknown stream dropped");
                }
            }
            AgentMessage::RelayClose { stream_id, reason } => {
                if self.state.relays.close_viewer(&self.agent_id, stream_id) {
                    debug!(stream_id, reason = ?reason, "Agent closed relay stream");
                }
            }
        }
    }

    /// Log and count a message that breaks the protocol; the connection stays open
    pub fn protocol_violation(&self, reason: &str) {
        warn!(reason = %reason, "Protocol violation");
        self.state.registry.record_violation(&self.agent_id);
    }

    /// Transport closed: mark the session down unless a newer connection owns it
    pub async fn on_close(&self) {
        if self
            .state
            .registry
            .mark_disconnected(&self.agent_id, self.connection_id)
        {
            self.state.streams.set_active(&self.agent_id, false);
        }
        self.state
            .relays
            .close(&self.agent_id, self.connection_id)
            .await;
        self.state
            .connections
            .unregister(&self.agent_id, self.connection_id)
            .await;
    }

    async fn reply(&self, message: ControlMessage) {
        if self.outbound.send(message).await.is_err() {
            debug!("Connection writer gone, reply dropped");
        }
    }
}

/// Drive one agent WebSocket until it closes
pub async fn serve_agent(state: BrokerState, agent_id: String, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ControlMessage>(OUTBOUND_QUEUE);
    let mut handler = ConnectionHandler::new(state, agent_id.clone(), tx);

    let span = info_span!(
        "agent_connection",
        agent_id = %agent_id,
        connection_id = handler.connection_id()
    );

    async move {
        info!("Agent connected");

        let writer = tokio::spawn(
            async move {
                while let Some(message) = rx.recv().await {
                    let text = match MessageCodec::encode(&message) {
                        Ok(text) => text,
                        Err(e) => {
                            error!("Failed to encode control message: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        debug!("Agent socket write failed: {}", e);
                        break;
                    }
                }
                let _ = sink.close().await;
            }
            .in_current_span(),
        );

        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => handler.handle_text(text.as_str()).await,
                Ok(Message::Binary(_)) => handler.protocol_violation("binary frame"),
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!("Agent socket read failed: {}", e);
                    break;
                }
            }
        }

        handler.on_close().await;
        drop(handler);
        writer.abort();
        info!("Agent connection closed");
    }
    .instrument(span)
    .await
}
