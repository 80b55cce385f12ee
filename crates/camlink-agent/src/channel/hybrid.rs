//! P2P first, relay on any failure

use super::{
    ChannelError, ChannelKind, HeartbeatPayload, Registration, StatusReport, TunnelChannel,
};
use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_P2P_TIMEOUT: Duration = Duration::from_secs(10);

pub struct HybridChannel {
    /// `None` when P2P is disabled in configuration; it is then never attempted
    p2p: Option<Arc<dyn TunnelChannel>>,
    tunnel: Arc<dyn TunnelChannel>,
    active: RwLock<Option<Arc<dyn TunnelChannel>>>,
    p2p_timeout: Duration,
}

impl HybridChannel {
    pub fn new(p2p: Option<Arc<dyn TunnelChannel>>, tunnel: Arc<dyn TunnelChannel>) -> Self {
        Self {
            p2p,
            tunnel,
            active: RwLock::new(None),
            p2p_timeout: DEFAULT_P2P_TIMEOUT,
        }
    }

    /// Cap on the P2P attempt; expiry counts as a P2P failure
    pub fn with_p2p_timeout(mut self, timeout: Duration) -> Self {
        self.p2p_timeout = timeout;
        self
    }

    /// Variant carrying traffic after registration
    pub fn active_kind(&self) -> Option<ChannelKind> {
        self.active().map(|channel| channel.kind())
    }

    fn active(&self) -> Option<Arc<dyn TunnelChannel>> {
        self.active.read().ok().and_then(|active| active.clone())
    }

    fn set_active(&self, channel: Arc<dyn TunnelChannel>) {
        if let Ok(mut active) = self.active.write() {
            *active = Some(channel);
        }
    }

    fn require_active(&self) -> Result<Arc<dyn TunnelChannel>, ChannelError> {
        self.active().ok_or(ChannelError::NotConnected)
    }

    async fn try_p2p(&self, p2p: &Arc<dyn TunnelChannel>) -> Result<Registration, ChannelError> {
        let attempt = async {
            let registration = p2p.register().await?;
            p2p.establish().await?;
            Ok::<_, ChannelError>(registration)
        };
        tokio::time::timeout(self.p2p_timeout, attempt)
            .await
            .unwrap_or(Err(ChannelError::Timeout(self.p2p_timeout)))
    }
}

#[async_trait]
impl TunnelChannel for HybridChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Hybrid
    }

    /// For P2P this covers both registration and link setup, so a P2P
    /// failure at either step still falls back to the relay
    async fn register(&self) -> Result<Registration, ChannelError> {
        if let Some(p2p) = &self.p2p {
            match self.try_p2p(p2p).await {
                Ok(registration) => {
                    info!("Hybrid channel using P2P");
                    self.set_active(p2p.clone());
                    return Ok(registration);
                }
                Err(e) => {
                    warn!(error = %e, "P2P unavailable, falling back to tunnel");
                    let _ = p2p.close().await;
                }
            }
        }

        let registration = self.tunnel.register().await?;
        self.set_active(self.tunnel.clone());
        Ok(registration)
    }

    /// The relay fallback keeps the full connection timeout after a failed P2P attempt
    fn setup_budget(&self, connection_timeout: Duration) -> Duration {
        match self.p2p {
            Some(_) => connection_timeout + self.p2p_timeout,
            None => connection_timeout,
        }
    }

    async fn establish(&self) -> Result<(), ChannelError> {
        let active = self.require_active()?;
        match active.kind() {
            // Already established during register
            ChannelKind::P2p => Ok(()),
            _ => active.establish().await,
        }
    }

    async fn send_heartbeat(&self, heartbeat: &HeartbeatPayload) -> Result<(), ChannelError> {
        self.require_active()?.send_heartbeat(heartbeat).await
    }

    async fn send_stream_data(&self, frame: &[u8]) -> Result<(), ChannelError> {
        self.require_active()?.send_stream_data(frame).await
    }

    async fn send_status_update(&self, update: &HeartbeatPayload) -> Result<(), ChannelError> {
        self.require_active()?.send_status_update(update).await
    }

    async fn send_status(&self, report: &StatusReport) -> Result<(), ChannelError> {
        self.require_active()?.send_status(report).await
    }

    fn is_connected(&self) -> bool {
        self.active().is_some_and(|channel| channel.is_connected())
    }

    fn tunnel_active(&self) -> bool {
        self.active().is_some_and(|channel| channel.tunnel_active())
    }

    async fn close(&self) -> Result<(), ChannelError> {
        let active = self.active.write().ok().and_then(|mut active| active.take());
        // Nothing active: the relay fallback may have connected and then failed to register
        let channel = active.unwrap_or_else(|| self.tunnel.clone());
        channel.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Clone, Copy, PartialEq)]
    enum Script {
        Succeed,
        Fail,
        Hang,
    }

    /// Records calls; registration follows its script
    struct ScriptedChannel {
        kind: ChannelKind,
        script: Script,
        registers: AtomicUsize,
        establishes: AtomicUsize,
        closes: AtomicUsize,
        up: AtomicBool,
    }

    impl ScriptedChannel {
        fn new(kind: ChannelKind, script: Script) -> Arc<Self> {
            Arc::new(Self {
                kind,
                script,
                registers: AtomicUsize::new(0),
                establishes: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
                up: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl TunnelChannel for ScriptedChannel {
        fn kind(&self) -> ChannelKind {
            self.kind
        }

        async fn register(&self) -> Result<Registration, ChannelError> {
            self.registers.fetch_add(1, Ordering::SeqCst);
            match self.script {
                Script::Succeed => {}
                Script::Fail => return Err(ChannelError::Negotiation("no route".to_string())),
                Script::Hang => std::future::pending::<()>().await,
            }
            Ok(Registration {
                agent_id: "cam-01".to_string(),
                stream_url: format!("{:?}://cam-01", self.kind),
                tunnel_port: 2956,
                server_time: None,
            })
        }

        async fn establish(&self) -> Result<(), ChannelError> {
            self.establishes.fetch_add(1, Ordering::SeqCst);
            self.up.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn send_heartbeat(&self, _: &HeartbeatPayload) -> Result<(), ChannelError> {
            Ok(())
        }

        async fn send_stream_data(&self, _: &[u8]) -> Result<(), ChannelError> {
            Ok(())
        }

        async fn send_status_update(&self, _: &HeartbeatPayload) -> Result<(), ChannelError> {
            Ok(())
        }

        async fn send_status(&self, _: &StatusReport) -> Result<(), ChannelError> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.up.load(Ordering::SeqCst)
        }

        fn tunnel_active(&self) -> bool {
            self.up.load(Ordering::SeqCst)
        }

        async fn close(&self) -> Result<(), ChannelError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.up.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_p2p_disabled_goes_straight_to_tunnel() {
        let tunnel = ScriptedChannel::new(ChannelKind::Tunnel, Script::Succeed);
        let hybrid = HybridChannel::new(None, tunnel.clone());

        hybrid.register().await.unwrap();
        hybrid.establish().await.unwrap();

        assert_eq!(hybrid.active_kind(), Some(ChannelKind::Tunnel));
        assert_eq!(tunnel.registers.load(Ordering::SeqCst), 1);
        assert_eq!(tunnel.establishes.load(Ordering::SeqCst), 1);
        assert!(hybrid.is_connected());
    }

    #[tokio::test]
    async fn test_p2p_failure_falls_back() {
        let p2p = ScriptedChannel::new(ChannelKind::P2p, Script::Fail);
        let tunnel = ScriptedChannel::new(ChannelKind::Tunnel, Script::Succeed);
        let hybrid = HybridChannel::new(Some(p2p.clone()), tunnel.clone());

        let registration = hybrid.register().await.unwrap();
        hybrid.establish().await.unwrap();

        assert_eq!(registration.stream_url, "Tunnel://cam-01");
        assert_eq!(hybrid.active_kind(), Some(ChannelKind::Tunnel));
        assert_eq!(p2p.registers.load(Ordering::SeqCst), 1);
        assert_eq!(p2p.closes.load(Ordering::SeqCst), 1);
        assert_eq!(tunnel.establishes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_p2p_success_skips_tunnel() {
        let p2p = ScriptedChannel::new(ChannelKind::P2p, Script::Succeed);
        let tunnel = ScriptedChannel::new(ChannelKind::Tunnel, Script::Succeed);
        let hybrid = HybridChannel::new(Some(p2p.clone()), tunnel.clone());

        hybrid.register().await.unwrap();
        hybrid.establish().await.unwrap();

        assert_eq!(hybrid.active_kind(), Some(ChannelKind::P2p));
        assert_eq!(p2p.establishes.load(Ordering::SeqCst), 1);
        assert_eq!(tunnel.registers.load(Ordering::SeqCst), 0);

        hybrid.close().await.unwrap();
        assert!(!hybrid.is_connected());
        assert_eq!(p2p.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sends_before_register_fail() {
        let tunnel = ScriptedChannel::new(ChannelKind::Tunnel, Script::Succeed);
        let hybrid = HybridChannel::new(None, tunnel);
        assert!(matches!(
            hybrid.send_stream_data(b"x").await,
            Err(ChannelError::NotConnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_p2p_times_out_and_falls_back() {
        let p2p = ScriptedChannel::new(ChannelKind::P2p, Script::Hang);
        let tunnel = ScriptedChannel::new(ChannelKind::Tunnel, Script::Succeed);
        let hybrid = HybridChannel::new(Some(p2p.clone()), tunnel.clone())
            .with_p2p_timeout(Duration::from_secs(3));

        let started = tokio::time::Instant::now();
        hybrid.register().await.unwrap();
        hybrid.establish().await.unwrap();

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_secs(4));
        assert_eq!(hybrid.active_kind(), Some(ChannelKind::Tunnel));
        assert_eq!(p2p.closes.load(Ordering::SeqCst), 1);
        assert_eq!(
            hybrid.setup_budget(Duration::from_secs(5)),
            Duration::from_secs(8)
        );
    }

    #[tokio::test]
    async fn test_failed_fallback_still_closes_tunnel() {
        let tunnel = ScriptedChannel::new(ChannelKind::Tunnel, Script::Fail);
        let hybrid = HybridChannel::new(None, tunnel.clone());

        assert!(hybrid.register().await.is_err());
        assert_eq!(hybrid.active_kind(), None);

        hybrid.close().await.unwrap();
        assert_eq!(tunnel.closes.load(Ordering::SeqCst), 1);
        assert_eq!(
            hybrid.setup_budget(Duration::from_secs(5)),
            Duration::from_secs(5)
        );
    }
}
