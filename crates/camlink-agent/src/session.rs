//! Agent session state machine
//!
//! `Stopped -> Starting -> Connecting -> Connected <-> Reconnecting -> Stopped`,
//! with `Error` terminal until the next [`AgentSession::start`].
//!
//! Three activities share the session once connected: the stream loop pulls
//! frames and calls [`AgentSession::send`], the monitor loop heartbeats and
//! reconnects, and the command loop serves broker commands. The outbound
//! buffer lock is held for a whole send-and-drain pass, which keeps frame
//! order across retries.

use crate::buffer::OutboundBuffer;
use crate::channel::{
    ChannelContext, ChannelError, ChannelFactory, ChannelKind, DefaultChannelFactory,
    HeartbeatPayload, Registration, StatusReport, TunnelChannel,
};
use crate::config::{AgentConfig, ConfigError};
use crate::identity::AgentIdentity;
use crate::source::{IdleSource, PlatformError, PlatformInit, StreamSource};
use crate::stats::SessionStats;
use camlink_proto::{AgentStats, ConnectionState, ControlMessage, StreamQuality, WireMessage};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Platform initialization failed: {0}")]
    Platform(#[from] PlatformError),

    #[error("Registration failed: {0}")]
    Registration(#[source] ChannelError),

    #[error("Session already running")]
    AlreadyRunning,

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Point-in-time view of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub agent_id: String,
    pub state: ConnectionState,
    pub stats: AgentStats,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub buffered_frames: usize,
    pub channel: Option<ChannelKind>,
    pub stream_url: Option<String>,
}

pub struct AgentSessionBuilder {
    identity: AgentIdentity,
    config: AgentConfig,
    source: Arc<dyn StreamSource>,
    platform: Option<Arc<dyn PlatformInit>>,
    factory: Arc<dyn ChannelFactory>,
}

impl AgentSessionBuilder {
    pub fn source(mut self, source: Arc<dyn StreamSource>) -> Self {
        self.source = source;
        self
    }

    pub fn platform(mut self, platform: Arc<dyn PlatformInit>) -> Self {
        self.platform = Some(platform);
        self
    }

    pub fn channel_factory(mut self, factory: Arc<dyn ChannelFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn build(self) -> Result<AgentSession, SessionError> {
        self.config.validate()?;

        let span = info_span!("agent_session", device_id = %self.identity.id);
        let (state_tx, _) = watch::channel(ConnectionState::Stopped);
        let (commands_tx, commands_rx) = mpsc::channel(32);
        let buffer = OutboundBuffer::new(&self.config.buffer);

        Ok(AgentSession {
            inner: Arc::new(SessionInner {
                identity: self.identity,
                config: RwLock::new(self.config),
                state: state_tx,
                channel: tokio::sync::RwLock::new(None),
                buffer: Mutex::new(buffer),
                stats: Arc::new(SessionStats::new()),
                source: self.source,
                platform: self.platform,
                factory: self.factory,
                commands_tx,
                commands_rx: Mutex::new(commands_rx),
                cancel: std::sync::Mutex::new(CancellationToken::new()),
                tasks: Mutex::new(Vec::new()),
                reconnecting: Mutex::new(()),
                last_heartbeat: std::sync::Mutex::new(None),
                registration: std::sync::Mutex::new(None),
                span,
            }),
        })
    }
}

/// Device-side connection lifecycle
#[derive(Clone)]
pub struct AgentSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    identity: AgentIdentity,
    /// Runtime copy; `update_config` edits timers and quality in place
    config: RwLock<AgentConfig>,
    state: watch::Sender<ConnectionState>,
    channel: tokio::sync::RwLock<Option<Arc<dyn TunnelChannel>>>,
    buffer: Mutex<OutboundBuffer>,
    stats: Arc<SessionStats>,
    source: Arc<dyn StreamSource>,
    platform: Option<Arc<dyn PlatformInit>>,
    factory: Arc<dyn ChannelFactory>,
    commands_tx: mpsc::Sender<ControlMessage>,
    commands_rx: Mutex<mpsc::Receiver<ControlMessage>>,
    cancel: std::sync::Mutex<CancellationToken>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Serializes reconnects between the monitor and command loops
    reconnecting: Mutex<()>,
    last_heartbeat: std::sync::Mutex<Option<DateTime<Utc>>>,
    registration: std::sync::Mutex<Option<Registration>>,
    span: Span,
}

impl AgentSession {
    pub fn builder(identity: AgentIdentity, config: AgentConfig) -> AgentSessionBuilder {
        AgentSessionBuilder {
            identity,
            config,
            source: Arc::new(IdleSource),
            platform: None,
            factory: Arc::new(DefaultChannelFactory::default()),
        }
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.inner.identity
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn stats(&self) -> AgentStats {
        self.inner.stats.snapshot()
    }

    pub fn config(&self) -> AgentConfig {
        self.inner.config_snapshot()
    }

    pub async fn status(&self) -> SessionStatus {
        let inner = &self.inner;
        let channel = inner.current_channel().await.map(|c| c.kind());
        let stream_url = inner
            .registration
            .lock()
            .ok()
            .and_then(|r| r.as_ref().map(|r| r.stream_url.clone()));

        SessionStatus {
            agent_id: inner.identity.id.clone(),
            state: inner.state(),
            stats: inner.stats.snapshot(),
            last_heartbeat: inner.last_heartbeat.lock().ok().and_then(|t| *t),
            buffered_frames: inner.buffer.lock().await.len(),
            channel,
            stream_url,
        }
    }

    /// Bring up platform, channel and loops
    ///
    /// Fails with `AlreadyRunning` unless the session is `Stopped` or `Error`.
    /// Any step failure leaves the session in `Error`.
    pub async fn start(&self) -> Result<(), SessionError> {
        let inner = self.inner.clone();
        let span = inner.span.clone();
        async move {
            match inner.state() {
                ConnectionState::Stopped => {}
                ConnectionState::Error => inner.shutdown().await,
                _ => return Err(SessionError::AlreadyRunning),
            }

            info!("Starting agent session");
            inner.set_state(ConnectionState::Starting);
            inner.stats.mark_started();

            if let Err(e) = inner.init_platform().await {
                error!(error = %e, "Platform initialization failed");
                inner.set_state(ConnectionState::Error);
                return Err(SessionError::Platform(e));
            }

            inner.set_state(ConnectionState::Connecting);
            let channel = match inner.connect_channel().await {
                Ok(channel) => channel,
                Err(e) => {
                    error!(error = %e, "Could not establish channel");
                    inner.set_state(ConnectionState::Error);
                    return Err(SessionError::Registration(e));
                }
            };
            *inner.channel.write().await = Some(channel);
            inner.set_state(ConnectionState::Connected);
            inner.report_status_update().await;

            let cancel = CancellationToken::new();
            if let Ok(mut slot) = inner.cancel.lock() {
                *slot = cancel.clone();
            }

            let span = Span::current();
            let handles = vec![
                tokio::spawn(
                    inner
                        .clone()
                        .stream_loop(cancel.clone())
                        .instrument(span.clone()),
                ),
                tokio::spawn(
                    inner
                        .clone()
                        .monitor_loop(cancel.clone())
                        .instrument(span.clone()),
                ),
                tokio::spawn(inner.clone().command_loop(cancel).instrument(span)),
            ];
            inner.tasks.lock().await.extend(handles);

            info!("Agent session started");
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Stop loops and close the channel. Safe to call repeatedly.
    pub async fn stop(&self) {
        let inner = self.inner.clone();
        let span = inner.span.clone();
        async move {
            inner.shutdown().await;
            if inner.state() != ConnectionState::Stopped {
                info!("Agent session stopped");
            }
            inner.set_state(ConnectionState::Stopped);
        }
        .instrument(span)
        .await
    }

    /// Hand a frame to the channel, buffering it on failure
    pub async fn send(&self, frame: Vec<u8>) {
        self.inner.send(frame).await
    }

    /// Replay buffered frames while connected
    pub async fn drain_buffer(&self) {
        let mut buffer = self.inner.buffer.lock().await;
        self.inner.drain(&mut buffer).await;
    }

    /// Run one reconnect cycle as if the channel had failed
    pub async fn reconnect(&self) -> bool {
        let cancel = self.inner.cancel_token();
        self.inner
            .handle_connection_error(&cancel)
            .instrument(self.inner.span.clone())
            .await
    }
}

impl SessionInner {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Session state changed");
        }
    }

    fn config_snapshot(&self) -> AgentConfig {
        self.config
            .read()
            .map(|config| config.clone())
            .unwrap_or_default()
    }

    fn cancel_token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .map(|token| token.clone())
            .unwrap_or_default()
    }

    async fn current_channel(&self) -> Option<Arc<dyn TunnelChannel>> {
        self.channel.read().await.clone()
    }

    async fn init_platform(&self) -> Result<(), PlatformError> {
        match &self.platform {
            Some(platform) => {
                platform.init_camera_interface().await?;
                platform.init_network_stack().await?;
                debug!("Platform initialized");
            }
            None => warn!("No platform initializer configured, skipping device bring-up"),
        }
        Ok(())
    }

    /// Create a channel and run register + establish under the connection timeout
    async fn connect_channel(&self) -> Result<Arc<dyn TunnelChannel>, ChannelError> {
        let config = self.config_snapshot();
        let timeout = config.timers.connection_timeout();
        let channel = self.factory.create(ChannelContext {
            identity: self.identity.clone(),
            config,
            commands: self.commands_tx.clone(),
            stats: self.stats.clone(),
        });

        let attempt = async {
            let registration = channel.register().await?;
            channel.establish().await?;
            Ok::<_, ChannelError>(registration)
        };

        let budget = channel.setup_budget(timeout);
        let result = match tokio::time::timeout(budget, attempt).await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Timeout(budget)),
        };

        match result {
            Ok(registration) => {
                info!(
                    channel = ?channel.kind(),
                    stream_url = %registration.stream_url,
                    "Channel established"
                );
                if let Ok(mut slot) = self.registration.lock() {
                    *slot = Some(registration);
                }
                Ok(channel)
            }
            Err(e) => {
                if let Err(close_err) = channel.close().await {
                    debug!(error = %close_err, "Error closing failed channel");
                }
                Err(e)
            }
        }
    }

    async fn shutdown(&self) {
        self.cancel_token().cancel();

        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "Session task ended abnormally");
                }
            }
        }

        if let Some(channel) = self.channel.write().await.take() {
            if let Err(e) = channel.close().await {
                warn!(error = %e, "Error closing channel");
            }
        }
    }

    fn heartbeat_payload(&self) -> HeartbeatPayload {
        HeartbeatPayload {
            status: self.state(),
            stats: self.stats.snapshot(),
        }
    }

    async fn report_status_update(&self) {
        if let Some(channel) = self.current_channel().await {
            if let Err(e) = channel.send_status_update(&self.heartbeat_payload()).await {
                debug!(error = %e, "Status update not delivered");
            }
        }
    }

    async fn send(&self, frame: Vec<u8>) {
        let mut buffer = self.buffer.lock().await;

        // A direct send would overtake buffered frames
        if !buffer.is_empty() {
            self.enqueue(&mut buffer, frame);
            self.drain(&mut buffer).await;
            return;
        }

        let channel = match self.state() {
            ConnectionState::Connected => self.current_channel().await,
            _ => None,
        };
        let result = match &channel {
            Some(channel) => channel.send_stream_data(&frame).await,
            None => Err(ChannelError::NotConnected),
        };

        match result {
            Ok(()) => self.stats.add_bytes_sent(frame.len() as u64),
            Err(e) => {
                debug!(error = %e, bytes = frame.len(), "Frame send failed, buffering");
                self.stats.add_packet_lost();
                self.enqueue(&mut buffer, frame);
                self.drain(&mut buffer).await;
            }
        }
    }

    fn enqueue(&self, buffer: &mut OutboundBuffer, frame: Vec<u8>) {
        let dropped = buffer.push_back(frame).dropped() as u64;
        if dropped > 0 {
            self.stats.add_frames_dropped(dropped);
            debug!(dropped = dropped, "Outbound buffer overflow");
        }
    }

    /// Stops at the first failure, leaving that frame at the head
    async fn drain(&self, buffer: &mut OutboundBuffer) {
        if buffer.is_empty() {
            return;
        }
        let Some(channel) = self.current_channel().await else {
            return;
        };

        let mut replayed = 0usize;
        while self.state() == ConnectionState::Connected {
            let Some(frame) = buffer.pop_front() else {
                break;
            };
            match channel.send_stream_data(&frame).await {
                Ok(()) => {
                    self.stats.add_bytes_sent(frame.len() as u64);
                    replayed += 1;
                }
                Err(_) => {
                    buffer.requeue(frame);
                    break;
                }
            }
        }

        if replayed > 0 {
            debug!(replayed = replayed, remaining = buffer.len(), "Drained outbound buffer");
        }
    }

    /// Returns `true` when a new channel is up
    async fn handle_connection_error(&self, cancel: &CancellationToken) -> bool {
        let _guard = self.reconnecting.lock().await;

        if !matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Reconnecting
        ) {
            return false;
        }

        self.set_state(ConnectionState::Reconnecting);
        let attempt = self.stats.add_reconnection();
        let wait = self.config_snapshot().timers.reconnect_interval();
        warn!(attempt = attempt, wait_secs = wait.as_secs(), "Connection lost, reconnecting");

        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep(wait) => {}
        }

        if let Some(old) = self.channel.write().await.take() {
            if let Err(e) = old.close().await {
                debug!(error = %e, "Error closing previous channel");
            }
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => return false,
            result = self.connect_channel() => result,
        };

        match result {
            Ok(channel) => {
                *self.channel.write().await = Some(channel);
                self.set_state(ConnectionState::Connected);
                info!(attempt = attempt, "Reconnected");
                self.report_status_update().await;

                let mut buffer = self.buffer.lock().await;
                self.drain(&mut buffer).await;
                true
            }
            Err(e) => {
                error!(attempt = attempt, error = %e, "Reconnection failed");
                self.set_state(ConnectionState::Error);
                false
            }
        }
    }

    async fn stream_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config_snapshot().timers.frame_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = self.source.get_frame() => frame,
            };

            if let Some(frame) = frame {
                self.send(frame).await;
            }
        }

        debug!("Stream loop stopped");
    }

    async fn monitor_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let interval = self.config_snapshot().timers.heartbeat_interval();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            if self.state() == ConnectionState::Error {
                break;
            }

            let healthy = match self.current_channel().await {
                Some(channel) => match channel.send_heartbeat(&self.heartbeat_payload()).await {
                    Ok(()) => {
                        if let Ok(mut last) = self.last_heartbeat.lock() {
                            *last = Some(Utc::now());
                        }
                        channel.is_connected()
                    }
                    Err(e) => {
                        warn!(error = %e, "Heartbeat failed");
                        false
                    }
                },
                None => false,
            };

            if !healthy && !self.handle_connection_error(&cancel).await {
                break;
            }
        }

        debug!("Monitor loop stopped");
    }

    async fn command_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut commands = self.commands_rx.lock().await;

        loop {
            let command = tokio::select! {
                _ = cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };
            self.handle_command(command, &cancel).await;
        }

        debug!("Command loop stopped");
    }

    async fn handle_command(&self, command: ControlMessage, cancel: &CancellationToken) {
        match command {
            ControlMessage::GetStatus => {
                let Some(channel) = self.current_channel().await else {
                    return;
                };
                let report = StatusReport {
                    connected: channel.is_connected(),
                    tunnel_active: channel.tunnel_active(),
                    uptime_secs: self.stats.uptime_secs(),
                };
                if let Err(e) = channel.send_status(&report).await {
                    warn!(error = %e, "Could not answer status query");
                }
            }
            ControlMessage::Restart => {
                info!("Restart requested by broker");
                self.handle_connection_error(cancel).await;
            }
            ControlMessage::UpdateConfig { config } => self.apply_config_update(&config),
            ControlMessage::Command { data } => {
                info!(command = %data, "Received operator command");
            }
            other => debug!(message_type = other.type_name(), "Ignoring control message"),
        }
    }

    /// Apply the runtime-tunable subset; invalid values are logged and skipped
    fn apply_config_update(&self, update: &serde_json::Value) {
        let Some(fields) = update.as_object() else {
            warn!("update_config payload is not an object");
            return;
        };
        let Ok(mut config) = self.config.write() else {
            return;
        };

        for (key, value) in fields {
            match key.as_str() {
                "heartbeat_interval_secs" => match value.as_u64() {
                    Some(secs) if secs > 0 => {
                        config.timers.heartbeat_interval_secs = secs;
                        info!(heartbeat_interval_secs = secs, "Heartbeat interval updated");
                    }
                    _ => warn!(value = %value, "Ignoring invalid heartbeat interval"),
                },
                "reconnect_interval_secs" => match value.as_u64() {
                    Some(secs) => {
                        config.timers.reconnect_interval_secs = secs;
                        info!(reconnect_interval_secs = secs, "Reconnect interval updated");
                    }
                    None => warn!(value = %value, "Ignoring invalid reconnect interval"),
                },
                "quality" => match serde_json::from_value::<StreamQuality>(value.clone()) {
                    Ok(quality) => {
                        config.quality = quality;
                        info!(quality = quality.as_str(), "Stream quality updated");
                    }
                    Err(_) => warn!(value = %value, "Ignoring invalid quality"),
                },
                other => debug!(key = other, "Ignoring unsupported config key"),
            }
        }
    }
}
