//! Direct peer channel
//!
//! NAT traversal is not implemented here. An embedding application supplies a
//! [`P2pNegotiator`]; without one, [`UnavailableNegotiator`] fails every attempt
//! and hybrid mode falls back to the relay.

use super::{
    ChannelContext, ChannelError, ChannelKind, HeartbeatPayload, Registration, StatusReport,
    TunnelChannel,
};
use crate::config::P2pConfig;
use async_trait::async_trait;
use camlink_proto::{AgentMessage, MessageCodec};
use chrono::Utc;
use std::sync::{Arc, Mutex};
use tracing::info;

/// An established peer connection
#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn send(&self, data: &[u8]) -> Result<(), ChannelError>;
    fn is_open(&self) -> bool;
    async fn close(&self);
}

/// Rendezvous registration plus hole punching
#[async_trait]
pub trait P2pNegotiator: Send + Sync {
    async fn register(
        &self,
        device_id: &str,
        config: &P2pConfig,
    ) -> Result<Registration, ChannelError>;

    async fn connect(
        &self,
        device_id: &str,
        config: &P2pConfig,
    ) -> Result<Box<dyn PeerLink>, ChannelError>;
}

#[derive(Debug, Default)]
pub struct UnavailableNegotiator;

#[async_trait]
impl P2pNegotiator for UnavailableNegotiator {
    async fn register(&self, _: &str, _: &P2pConfig) -> Result<Registration, ChannelError> {
        Err(ChannelError::Negotiation(
            "no NAT traversal implementation configured".to_string(),
        ))
    }

    async fn connect(&self, _: &str, _: &P2pConfig) -> Result<Box<dyn PeerLink>, ChannelError> {
        Err(ChannelError::Negotiation(
            "no NAT traversal implementation configured".to_string(),
        ))
    }
}

pub struct P2pChannel {
    ctx: ChannelContext,
    negotiator: Arc<dyn P2pNegotiator>,
    link: Mutex<Option<Arc<dyn PeerLink>>>,
}

impl P2pChannel {
    pub fn new(ctx: ChannelContext, negotiator: Arc<dyn P2pNegotiator>) -> Self {
        Self {
            ctx,
            negotiator,
            link: Mutex::new(None),
        }
    }

    async fn send_message(&self, message: &AgentMessage) -> Result<(), ChannelError> {
        let text = MessageCodec::encode(message)?;
        self.send_raw(text.as_bytes()).await
    }

    fn current_link(&self) -> Option<Arc<dyn PeerLink>> {
        self.link.lock().ok().and_then(|link| link.clone())
    }

    async fn send_raw(&self, data: &[u8]) -> Result<(), ChannelError> {
        match self.current_link() {
            Some(link) if link.is_open() => link.send(data).await,
            _ => Err(ChannelError::NotConnected),
        }
    }
}

#[async_trait]
impl TunnelChannel for P2pChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::P2p
    }

    async fn register(&self) -> Result<Registration, ChannelError> {
        let p2p = &self.ctx.config.p2p;
        if p2p.registry_url.as_deref().map_or(true, str::is_empty) {
            return Err(ChannelError::Negotiation(
                "no P2P registry configured".to_string(),
            ));
        }
        self.negotiator.register(&self.ctx.identity.id, p2p).await
    }

    async fn establish(&self) -> Result<(), ChannelError> {
        let link = self
            .negotiator
            .connect(&self.ctx.identity.id, &self.ctx.config.p2p)
            .await?;
        info!(device_id = %self.ctx.identity.id, "P2P link established");
        if let Ok(mut slot) = self.link.lock() {
            *slot = Some(Arc::from(link));
        }
        Ok(())
    }

    async fn send_heartbeat(&self, heartbeat: &HeartbeatPayload) -> Result<(), ChannelError> {
        self.send_message(&AgentMessage::Heartbeat {
            device_id: self.ctx.identity.id.clone(),
            timestamp: Utc::now().timestamp_millis() as f64 / 1000.0,
            status: heartbeat.status,
            stats: Some(heartbeat.stats.clone()),
        })
        .await
    }

    async fn send_stream_data(&self, frame: &[u8]) -> Result<(), ChannelError> {
        self.send_raw(frame).await
    }

    async fn send_status_update(&self, update: &HeartbeatPayload) -> Result<(), ChannelError> {
        self.send_message(&AgentMessage::StatusUpdate {
            status: update.status,
            stats: Some(update.stats.clone()),
        })
        .await
    }

    async fn send_status(&self, report: &StatusReport) -> Result<(), ChannelError> {
        self.send_message(&AgentMessage::Status {
            device_id: self.ctx.identity.id.clone(),
            connected: report.connected,
            tunnel_active: report.tunnel_active,
            uptime: report.uptime_secs,
        })
        .await
    }

    fn is_connected(&self) -> bool {
        self.current_link().is_some_and(|link| link.is_open())
    }

    fn tunnel_active(&self) -> bool {
        self.is_connected()
    }

    async fn close(&self) -> Result<(), ChannelError> {
        let link = self.link.lock().ok().and_then(|mut slot| slot.take());
        if let Some(link) = link {
            link.close().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::identity::{AgentIdentity, IdentitySource};
    use crate::stats::SessionStats;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    struct LoopbackLink {
        sent: Arc<AtomicUsize>,
        open: AtomicBool,
    }

    #[async_trait]
    impl PeerLink for LoopbackLink {
        async fn send(&self, data: &[u8]) -> Result<(), ChannelError> {
            self.sent.fetch_add(data.len(), Ordering::SeqCst);
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        async fn close(&self) {
            self.open.store(false, Ordering::SeqCst);
        }
    }

    struct LoopbackNegotiator {
        sent: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl P2pNegotiator for LoopbackNegotiator {
        async fn register(&self, device_id: &str, _: &P2pConfig) -> Result<Registration, ChannelError> {
            Ok(Registration {
                agent_id: device_id.to_string(),
                stream_url: format!("p2p://{}", device_id),
                tunnel_port: 0,
                server_time: None,
            })
        }

        async fn connect(&self, _: &str, _: &P2pConfig) -> Result<Box<dyn PeerLink>, ChannelError> {
            Ok(Box::new(LoopbackLink {
                sent: self.sent.clone(),
                open: AtomicBool::new(true),
            }))
        }
    }

    fn context(registry_url: Option<&str>) -> ChannelContext {
        let (commands, _rx) = mpsc::channel(1);
        let mut config = AgentConfig::default();
        config.p2p.enabled = true;
        config.p2p.registry_url = registry_url.map(str::to_string);
        ChannelContext {
            identity: AgentIdentity {
                id: "cam-01".to_string(),
                source: IdentitySource::Configured,
            },
            config,
            commands,
            stats: Arc::new(SessionStats::new()),
        }
    }

    #[tokio::test]
    async fn test_unavailable_negotiator_fails() {
        let channel = P2pChannel::new(
            context(Some("https://registry.example.com")),
            Arc::new(UnavailableNegotiator),
        );
        assert!(matches!(
            channel.register().await,
            Err(ChannelError::Negotiation(_))
        ));
        assert!(!channel.is_connected());
    }

    #[tokio::test]
    async fn test_missing_registry_fails_before_negotiation() {
        let sent = Arc::new(AtomicUsize::new(0));
        let channel = P2pChannel::new(context(None), Arc::new(LoopbackNegotiator { sent }));
        assert!(matches!(
            channel.register().await,
            Err(ChannelError::Negotiation(_))
        ));
    }

    #[tokio::test]
    async fn test_injected_negotiator_carries_frames() {
        let sent = Arc::new(AtomicUsize::new(0));
        let channel = P2pChannel::new(
            context(Some("https://registry.example.com")),
            Arc::new(LoopbackNegotiator { sent: sent.clone() }),
        );

        let registration = channel.register().await.unwrap();
        assert_eq!(registration.stream_url, "p2p://cam-01");
        assert!(matches!(
            channel.send_stream_data(b"frame").await,
            Err(ChannelError::NotConnected)
        ));

        channel.establish().await.unwrap();
        assert!(channel.is_connected());
        channel.send_stream_data(b"frame").await.unwrap();
        assert_eq!(sent.load(Ordering::SeqCst), 5);

        channel.close().await.unwrap();
        assert!(!channel.is_connected());
    }
}
