//! Broker-relayed channel over a single WebSocket

use super::{
    ChannelContext, ChannelError, ChannelKind, HeartbeatPayload, Registration, StatusReport,
    TunnelChannel,
};
use crate::forwarder::CameraForwarder;
use crate::stats::SessionStats;
use async_trait::async_trait;
use camlink_proto::{
    AgentMessage, ControlMessage, MessageCodec, WireMessage, AGENT_PATH_PREFIX,
    DEFAULT_CAPABILITIES, PROTOCOL_VERSION,
};
use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn, Instrument};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ReplySlot = Arc<std::sync::Mutex<Option<oneshot::Sender<ControlMessage>>>>;

const CONTROL_QUEUE: usize = 32;
const DATA_QUEUE: usize = 256;

/// Handle for queueing agent messages on the WebSocket writer task
///
/// Two lanes: handshake, heartbeat and status messages go on `control`, which
/// the writer always serves first; stream frames and relay payloads go on
/// `data`. Waits on either lane are bounded by the writer's stall timeout,
/// after which the writer exits and every pending send fails with `Closed`.
#[derive(Clone)]
pub(crate) struct Outbound {
    control: mpsc::Sender<Message>,
    data: mpsc::Sender<Message>,
}

impl Outbound {
    pub(crate) fn new(control: mpsc::Sender<Message>, data: mpsc::Sender<Message>) -> Self {
        Self { control, data }
    }

    pub(crate) async fn send(&self, message: &AgentMessage) -> Result<(), ChannelError> {
        let text = MessageCodec::encode(message)?;
        self.control
            .send(Message::Text(text))
            .await
            .map_err(|_| ChannelError::Closed)
    }

    /// Relay payloads; waiting for queue space gives the camera socket backpressure
    pub(crate) async fn send_data(&self, message: &AgentMessage) -> Result<(), ChannelError> {
        let text = MessageCodec::encode(message)?;
        self.data
            .send(Message::Text(text))
            .await
            .map_err(|_| ChannelError::Closed)
    }

    /// Stream frames never wait: a full queue fails so the session buffers the frame
    pub(crate) fn try_send_data(&self, message: &AgentMessage) -> Result<(), ChannelError> {
        let text = MessageCodec::encode(message)?;
        self.data
            .try_send(Message::Text(text))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => ChannelError::Backpressure,
                mpsc::error::TrySendError::Closed(_) => ChannelError::Closed,
            })
    }

    fn close(&self) {
        let _ = self.control.try_send(Message::Close(None));
    }
}

/// One live WebSocket with its reader/writer tasks
struct Link {
    outbound: Outbound,
    forwarder: Arc<CameraForwarder>,
    reader: JoinHandle<()>,
}

impl Drop for Link {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

pub struct RelayChannel {
    ctx: ChannelContext,
    link: Mutex<Option<Link>>,
    replies: ReplySlot,
    connected: Arc<AtomicBool>,
    tunnel_active: Arc<AtomicBool>,
    tunnel_port: AtomicU16,
}

impl RelayChannel {
    pub fn new(ctx: ChannelContext) -> Self {
        let hint = ctx.config.tunnel_port;
        Self {
            ctx,
            link: Mutex::new(None),
            replies: Arc::new(std::sync::Mutex::new(None)),
            connected: Arc::new(AtomicBool::new(false)),
            tunnel_active: Arc::new(AtomicBool::new(false)),
            tunnel_port: AtomicU16::new(hint),
        }
    }

    fn device_id(&self) -> &str {
        &self.ctx.identity.id
    }

    fn endpoint(&self) -> String {
        format!(
            "{}{}/{}",
            self.ctx.config.broker_url.trim_end_matches('/'),
            AGENT_PATH_PREFIX,
            self.device_id()
        )
    }

    /// Relay port assigned by the broker (the configured hint until registered)
    pub fn tunnel_port(&self) -> u16 {
        self.tunnel_port.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> Result<(), ChannelError> {
        let mut link = self.link.lock().await;
        if link.is_some() && self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        let url = self.endpoint();
        let connect_error = |reason: String| ChannelError::Connect {
            url: url.clone(),
            reason,
        };

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| connect_error(e.to_string()))?;
        if let Some(token) = &self.ctx.config.auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| connect_error(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let timeout = self.ctx.config.timers.connection_timeout();
        let (ws, _response) = tokio::time::timeout(timeout, connect_async(request))
            .await
            .map_err(|_| ChannelError::Timeout(timeout))?
            .map_err(|e| connect_error(e.to_string()))?;

        debug!(url = %url, "WebSocket connected");

        let (sink, source) = ws.split();
        let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE);
        let (data_tx, data_rx) = mpsc::channel(DATA_QUEUE);
        let outbound = Outbound::new(control_tx, data_tx);
        let forwarder = Arc::new(CameraForwarder::new(
            self.ctx.config.camera.clone(),
            timeout,
            outbound.clone(),
            self.ctx.stats.clone(),
        ));

        self.connected.store(true, Ordering::SeqCst);

        // A broker that stops reading must not wedge heartbeats forever
        let timers = &self.ctx.config.timers;
        let stall_timeout = timers.connection_timeout().min(timers.heartbeat_interval());

        tokio::spawn(
            writer_task(WriterState {
                sink,
                control: control_rx,
                data: data_rx,
                stall_timeout,
                connected: self.connected.clone(),
                device_id: self.device_id().to_string(),
            })
            .in_current_span(),
        );

        let reader = tokio::spawn(
            reader_task(ReaderState {
                source,
                replies: self.replies.clone(),
                commands: self.ctx.commands.clone(),
                forwarder: forwarder.clone(),
                connected: self.connected.clone(),
                tunnel_active: self.tunnel_active.clone(),
                stats: self.ctx.stats.clone(),
                device_id: self.device_id().to_string(),
            })
            .in_current_span(),
        );

        // Replacing a dead link aborts its reader
        *link = Some(Link {
            outbound,
            forwarder,
            reader,
        });

        Ok(())
    }

    async fn outbound(&self) -> Result<Outbound, ChannelError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ChannelError::NotConnected);
        }
        self.link
            .lock()
            .await
            .as_ref()
            .map(|link| link.outbound.clone())
            .ok_or(ChannelError::NotConnected)
    }

    /// Send a handshake message and wait for the matching reply
    async fn request(&self, message: &AgentMessage) -> Result<ControlMessage, ChannelError> {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut slot) = self.replies.lock() {
            *slot = Some(tx);
        }

        self.outbound().await?.send(message).await?;

        let timeout = self.ctx.config.timers.connection_timeout();
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ChannelError::Closed),
            Err(_) => Err(ChannelError::Timeout(timeout)),
        }
    }
}

#[async_trait]
impl TunnelChannel for RelayChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Tunnel
    }

    async fn register(&self) -> Result<Registration, ChannelError> {
        self.connect().await?;

        let config = &self.ctx.config;
        let request = AgentMessage::Register {
            device_id: self.device_id().to_string(),
            tunnel_port: Some(config.tunnel_port),
            capabilities: DEFAULT_CAPABILITIES.iter().map(|c| c.to_string()).collect(),
            version: PROTOCOL_VERSION.to_string(),
            quality: config.quality,
        };

        match self.request(&request).await? {
            ControlMessage::RegistrationConfirmed {
                agent_id,
                stream_url,
                server_time,
                tunnel_port,
            } => {
                self.tunnel_port.store(tunnel_port, Ordering::SeqCst);
                info!(
                    agent_id = %agent_id,
                    stream_url = %stream_url,
                    tunnel_port = tunnel_port,
                    "Registered with broker"
                );
                Ok(Registration {
                    agent_id,
                    stream_url,
                    tunnel_port,
                    server_time: Some(server_time),
                })
            }
            ControlMessage::TunnelError { reason } => Err(ChannelError::Rejected(reason)),
            other => Err(ChannelError::UnexpectedReply(other.type_name().to_string())),
        }
    }

    async fn establish(&self) -> Result<(), ChannelError> {
        let camera = &self.ctx.config.camera;
        let request = AgentMessage::CreateTunnel {
            device_id: self.device_id().to_string(),
            camera_ip: camera.ip.clone(),
            camera_port: camera.port,
            tunnel_port: self.tunnel_port(),
        };

        match self.request(&request).await? {
            ControlMessage::TunnelCreated { tunnel_port, .. } => {
                self.tunnel_active.store(true, Ordering::SeqCst);
                info!(
                    tunnel_port = tunnel_port,
                    camera = %camera.address(),
                    "Tunnel established"
                );
                Ok(())
            }
            ControlMessage::TunnelError { reason } => Err(ChannelError::Rejected(reason)),
            other => Err(ChannelError::UnexpectedReply(other.type_name().to_string())),
        }
    }

    async fn send_heartbeat(&self, heartbeat: &HeartbeatPayload) -> Result<(), ChannelError> {
        let timestamp = Utc::now().timestamp_millis() as f64 / 1000.0;
        self.outbound()
            .await?
            .send(&AgentMessage::Heartbeat {
                device_id: self.device_id().to_string(),
                timestamp,
                status: heartbeat.status,
                stats: Some(heartbeat.stats.clone()),
            })
            .await
    }

    async fn send_stream_data(&self, frame: &[u8]) -> Result<(), ChannelError> {
        if !self.tunnel_active.load(Ordering::SeqCst) {
            return Err(ChannelError::NotConnected);
        }
        self.outbound()
            .await?
            .try_send_data(&AgentMessage::StreamData {
                device_id: self.device_id().to_string(),
                data: frame.to_vec(),
            })
    }

    async fn send_status_update(&self, update: &HeartbeatPayload) -> Result<(), ChannelError> {
        self.outbound()
            .await?
            .send(&AgentMessage::StatusUpdate {
                status: update.status,
                stats: Some(update.stats.clone()),
            })
            .await
    }

    async fn send_status(&self, report: &StatusReport) -> Result<(), ChannelError> {
        self.outbound()
            .await?
            .send(&AgentMessage::Status {
                device_id: self.device_id().to_string(),
                connected: report.connected,
                tunnel_active: report.tunnel_active,
                uptime: report.uptime_secs,
            })
            .await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn tunnel_active(&self) -> bool {
        self.is_connected() && self.tunnel_active.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), ChannelError> {
        let link = self.link.lock().await.take();
        self.connected.store(false, Ordering::SeqCst);
        self.tunnel_active.store(false, Ordering::SeqCst);

        if let Ok(mut slot) = self.replies.lock() {
            slot.take();
        }

        if let Some(link) = link {
            link.forwarder.close_all();
            // Writer exits after flushing the close frame
            link.outbound.close();
            debug!(device_id = %self.device_id(), "Relay channel closed");
        }

        Ok(())
    }
}

struct WriterState {
    sink: SplitSink<WsStream, Message>,
    control: mpsc::Receiver<Message>,
    data: mpsc::Receiver<Message>,
    stall_timeout: Duration,
    connected: Arc<AtomicBool>,
    device_id: String,
}

async fn writer_task(mut state: WriterState) {
    let device_id = state.device_id.clone();

    loop {
        let message = tokio::select! {
            biased;
            message = state.control.recv() => message,
            message = state.data.recv() => message,
        };
        let Some(message) = message else {
            break;
        };

        let closing = matches!(message, Message::Close(_));
        match tokio::time::timeout(state.stall_timeout, state.sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(device_id = %device_id, error = %e, "WebSocket send failed");
                break;
            }
            Err(_) => {
                warn!(
                    device_id = %device_id,
                    stall_secs = state.stall_timeout.as_secs_f64(),
                    "WebSocket write stalled, dropping link"
                );
                break;
            }
        }
        if closing {
            break;
        }
    }

    state.connected.store(false, Ordering::SeqCst);
    let _ = tokio::time::timeout(state.stall_timeout, state.sink.close()).await;
    debug!(device_id = %device_id, "WebSocket writer task ended");
}

struct ReaderState {
    source: SplitStream<WsStream>,
    replies: ReplySlot,
    commands: mpsc::Sender<ControlMessage>,
    forwarder: Arc<CameraForwarder>,
    connected: Arc<AtomicBool>,
    tunnel_active: Arc<AtomicBool>,
    stats: Arc<SessionStats>,
    device_id: String,
}

async fn reader_task(mut state: ReaderState) {
    while let Some(frame) = state.source.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => {
                debug!(device_id = %state.device_id, "Broker closed the connection");
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(device_id = %state.device_id, error = %e, "WebSocket read failed");
                break;
            }
        };

        let message = match MessageCodec::decode::<ControlMessage>(&text) {
            Ok(message) => message,
            Err(e) => {
                warn!(device_id = %state.device_id, error = %e, "Ignoring broker message");
                continue;
            }
        };

        match message {
            reply if reply.is_handshake_reply() => {
                let waiter = state.replies.lock().ok().and_then(|mut slot| slot.take());
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(reply);
                    }
                    None => debug!(
                        device_id = %state.device_id,
                        message_type = reply.type_name(),
                        "Unsolicited handshake reply"
                    ),
                }
            }
            ControlMessage::RelayOpen { stream_id } => state.forwarder.open(stream_id),
            ControlMessage::RelayData { stream_id, data } => {
                state.stats.add_bytes_received(data.len() as u64);
                state.forwarder.write(stream_id, data).await;
            }
            ControlMessage::RelayClose { stream_id, reason } => {
                state.forwarder.close(stream_id, reason.as_deref())
            }
            command => {
                if state.commands.send(command).await.is_err() {
                    debug!(device_id = %state.device_id, "Session no longer accepts commands");
                }
            }
        }
    }

    state.connected.store(false, Ordering::SeqCst);
    state.tunnel_active.store(false, Ordering::SeqCst);
    state.forwarder.close_all();
    if let Ok(mut slot) = state.replies.lock() {
        slot.take();
    }
    debug!(device_id = %state.device_id, "WebSocket reader task ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(byte: u8) -> AgentMessage {
        AgentMessage::StreamData {
            device_id: "cam-01".to_string(),
            data: vec![byte; 8],
        }
    }

    #[tokio::test]
    async fn test_full_data_lane_fails_fast_and_spares_control() {
        let (control_tx, mut control_rx) = mpsc::channel(4);
        let (data_tx, data_rx) = mpsc::channel(2);
        let outbound = Outbound::new(control_tx, data_tx);

        outbound.try_send_data(&frame(1)).unwrap();
        outbound.try_send_data(&frame(2)).unwrap();
        assert!(matches!(
            outbound.try_send_data(&frame(3)),
            Err(ChannelError::Backpressure)
        ));

        // Heartbeats still queue while stream data is backed up
        outbound
            .send(&AgentMessage::Heartbeat {
                device_id: "cam-01".to_string(),
                timestamp: 0.0,
                status: camlink_proto::ConnectionState::Connected,
                stats: None,
            })
            .await
            .unwrap();
        assert!(matches!(control_rx.recv().await, Some(Message::Text(_))));

        drop(data_rx);
        assert!(matches!(
            outbound.try_send_data(&frame(4)),
            Err(ChannelError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_sends_before_connect_fail() {
        let (commands, _rx) = mpsc::channel(1);
        let channel = RelayChannel::new(ChannelContext {
            identity: crate::identity::AgentIdentity {
                id: "cam-01".to_string(),
                source: crate::identity::IdentitySource::Configured,
            },
            config: crate::config::AgentConfig::default(),
            commands,
            stats: Arc::new(SessionStats::new()),
        });

        assert!(matches!(
            channel.send_stream_data(b"frame").await,
            Err(ChannelError::NotConnected)
        ));
        assert!(!channel.is_connected());
        channel.close().await.unwrap();
    }
}
