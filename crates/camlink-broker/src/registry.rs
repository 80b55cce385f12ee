//! Session and stream registries shared by every agent connection
//!
//! Both registries are keyed by agent id and backed by `DashMap`, so mutations
//! on a given agent are serialized by the shard lock while different agents
//! proceed in parallel. Records are never removed here; a disconnect only flips
//! status flags.

use camlink_proto::{AgentStats, ConnectionState, StreamQuality};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Connected,
    Disconnected,
}

/// Broker-side view of one agent
#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub agent_id: String,
    pub status: SessionStatus,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Monotonic receipt time of the last heartbeat (or the registration)
    #[serde(skip)]
    pub last_seen: Instant,
    pub stats: AgentStats,
    /// State the agent last reported about itself
    pub reported_state: ConnectionState,
    pub capabilities: Vec<String>,
    pub version: String,
    pub quality: StreamQuality,
    pub tunnel_port: u16,
    pub tunnel_active: bool,
    pub protocol_violations: u64,
    /// Generation of the connection that owns this record
    #[serde(skip)]
    pub connection_id: u64,
}

/// Registration data collected from a `register` message
#[derive(Debug, Clone)]
pub struct NewSession {
    pub agent_id: String,
    pub connection_id: u64,
    pub capabilities: Vec<String>,
    pub version: String,
    pub quality: StreamQuality,
    pub tunnel_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Updated,
    /// The sweeper had marked the session disconnected; the heartbeat revived it
    Revived,
    /// Unknown agent or a superseded connection
    Stale,
}

#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    sessions: Arc<DashMap<String, SessionRecord>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or overwrite the record for an agent
    ///
    /// Returns the replaced record when the agent was already known.
    pub fn register(&self, session: NewSession) -> Option<SessionRecord> {
        let record = SessionRecord {
            agent_id: session.agent_id.clone(),
            status: SessionStatus::Connected,
            connected_at: Utc::now(),
            last_heartbeat: None,
            last_seen: Instant::now(),
            stats: AgentStats::default(),
            reported_state: ConnectionState::Connecting,
            capabilities: session.capabilities,
            version: session.version,
            quality: session.quality,
            tunnel_port: session.tunnel_port,
            tunnel_active: false,
            protocol_violations: 0,
            connection_id: session.connection_id,
        };

        let previous = self.sessions.insert(session.agent_id.clone(), record);

        if let Some(ref replaced) = previous {
            info!(
                agent_id = %session.agent_id,
                tunnel_port = session.tunnel_port,
                old_connected_at = %replaced.connected_at,
                "Re-registered existing agent (replaced previous session)"
            );
        } else {
            info!(
                agent_id = %session.agent_id,
                tunnel_port = session.tunnel_port,
                "Registered new agent"
            );
        }

        previous
    }

    pub fn heartbeat(
        &self,
        agent_id: &str,
        connection_id: u64,
        state: ConnectionState,
        stats: Option<AgentStats>,
    ) -> HeartbeatOutcome {
        let Some(mut record) = self.sessions.get_mut(agent_id) else {
            return HeartbeatOutcome::Stale;
        };
        if record.connection_id != connection_id {
            return HeartbeatOutcome::Stale;
        }

        record.last_seen = Instant::now();
        record.last_heartbeat = Some(Utc::now());
        record.reported_state = state;
        if let Some(stats) = stats {
            record.stats = stats;
        }

        if record.status == SessionStatus::Disconnected {
            record.status = SessionStatus::Connected;
            info!(agent_id = %agent_id, "Heartbeat revived disconnected session");
            HeartbeatOutcome::Revived
        } else {
            HeartbeatOutcome::Updated
        }
    }

    /// Merge a `status_update` into the record
    ///
    /// Returns false for an unknown agent or a superseded connection.
    pub fn merge_status(
        &self,
        agent_id: &str,
        connection_id: u64,
        state: ConnectionState,
        stats: Option<AgentStats>,
    ) -> bool {
        match self.sessions.get_mut(agent_id) {
            Some(mut record) if record.connection_id == connection_id => {
                record.reported_state = state;
                if let Some(stats) = stats {
                    record.stats = stats;
                }
                true
            }
            _ => false,
        }
    }

    pub fn mark_tunnel(&self, agent_id: &str, active: bool) {
        if let Some(mut record) = self.sessions.get_mut(agent_id) {
            record.tunnel_active = active;
        }
    }

    pub fn record_violation(&self, agent_id: &str) {
        if let Some(mut record) = self.sessions.get_mut(agent_id) {
            record.protocol_violations += 1;
        }
    }

    /// Mark the session disconnected if `connection_id` still owns it
    ///
    /// Returns false for a superseded connection, leaving the newer one intact.
    pub fn mark_disconnected(&self, agent_id: &str, connection_id: u64) -> bool {
        let Some(mut record) = self.sessions.get_mut(agent_id) else {
            return false;
        };
        if record.connection_id != connection_id {
            debug!(
                agent_id = %agent_id,
                connection_id,
                current = record.connection_id,
                "Ignoring close of superseded connection"
            );
            return false;
        }

        record.status = SessionStatus::Disconnected;
        record.tunnel_active = false;
        info!(agent_id = %agent_id, "Agent disconnected");
        true
    }

    /// Flip every connected session silent for longer than `timeout`
    pub fn expire_stale(&self, timeout: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut expired = Vec::new();

        for mut entry in self.sessions.iter_mut() {
            let record = entry.value_mut();
            if record.status == SessionStatus::Connected
                && now.duration_since(record.last_seen) > timeout
            {
                record.status = SessionStatus::Disconnected;
                record.tunnel_active = false;
                warn!(
                    agent_id = %record.agent_id,
                    silent_secs = now.duration_since(record.last_seen).as_secs(),
                    "No heartbeat within liveness window, marking disconnected"
                );
                expired.push(record.agent_id.clone());
            }
        }

        expired
    }

    pub fn get(&self, agent_id: &str) -> Option<SessionRecord> {
        self.sessions.get(agent_id).map(|r| r.value().clone())
    }

    /// All records, sorted by agent id
    pub fn list(&self) -> Vec<SessionRecord> {
        let mut records: Vec<_> = self.sessions.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        records
    }

    /// `(total, connected)`
    pub fn counts(&self) -> (usize, usize) {
        let connected = self
            .sessions
            .iter()
            .filter(|r| r.status == SessionStatus::Connected)
            .count();
        (self.sessions.len(), connected)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamRecord {
    pub agent_id: String,
    pub url: String,
    pub quality: StreamQuality,
    pub active: bool,
    pub viewer_count: u32,
    pub frames_received: u64,
    pub bytes_received: u64,
    pub updated_at: DateTime<Utc>,
    /// Generation of the connection publishing this stream
    #[serde(skip)]
    pub connection_id: u64,
}

#[derive(Debug, Clone, Default)]
pub struct StreamRegistry {
    streams: Arc<DashMap<String, StreamRecord>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or overwrite the stream published by an agent
    ///
    /// Counters survive a re-registration; viewers reattach through the relay.
    pub fn upsert(&self, agent_id: &str, connection_id: u64, url: String, quality: StreamQuality) {
        let now = Utc::now();
        self.streams
            .entry(agent_id.to_string())
            .and_modify(|stream| {
                stream.url = url.clone();
                stream.quality = quality;
                stream.active = true;
                stream.updated_at = now;
                stream.connection_id = connection_id;
            })
            .or_insert_with(|| StreamRecord {
                agent_id: agent_id.to_string(),
                url: url.clone(),
                quality,
                active: true,
                viewer_count: 0,
                frames_received: 0,
                bytes_received: 0,
                updated_at: now,
                connection_id,
            });
    }

    /// Count a frame; false for an unknown stream or a superseded publisher
    pub fn record_frame(&self, agent_id: &str, connection_id: u64, len: usize) -> bool {
        match self.streams.get_mut(agent_id) {
            Some(mut stream) if stream.connection_id == connection_id => {
                stream.frames_received += 1;
                stream.bytes_received += len as u64;
                stream.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }

    pub fn set_active(&self, agent_id: &str, active: bool) {
        if let Some(mut stream) = self.streams.get_mut(agent_id) {
            stream.active = active;
            stream.updated_at = Utc::now();
        }
    }

    pub fn viewer_joined(&self, agent_id: &str) {
        if let Some(mut stream) = self.streams.get_mut(agent_id) {
            stream.viewer_count += 1;
        }
    }

    pub fn viewer_left(&self, agent_id: &str) {
        if let Some(mut stream) = self.streams.get_mut(agent_id) {
            stream.viewer_count = stream.viewer_count.saturating_sub(1);
        }
    }

    pub fn get(&self, agent_id: &str) -> Option<StreamRecord> {
        self.streams.get(agent_id).map(|s| s.value().clone())
    }

    pub fn list(&self) -> Vec<StreamRecord> {
        let mut streams: Vec<_> = self.streams.iter().map(|s| s.value().clone()).collect();
        streams.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        streams
    }

    /// `(total, active, viewers)`
    pub fn counts(&self) -> (usize, usize, u32) {
        let mut active = 0;
        let mut viewers = 0;
        for stream in self.streams.iter() {
            if stream.active {
                active += 1;
            }
            viewers += stream.viewer_count;
        }
        (self.streams.len(), active, viewers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(agent_id: &str, connection_id: u64) -> NewSession {
        NewSession {
            agent_id: agent_id.to_string(),
            connection_id,
            capabilities: vec!["rtsp".to_string()],
            version: "1.0.0".to_string(),
            quality: StreamQuality::Medium,
            tunnel_port: 8554,
        }
    }

    #[test]
    fn test_register_and_replace() {
        let registry = AgentRegistry::new();
        assert!(registry.register(session("cam-01", 1)).is_none());

        registry.record_violation("cam-01");
        let replaced = registry.register(session("cam-01", 2)).unwrap();
        assert_eq!(replaced.connection_id, 1);
        assert_eq!(replaced.protocol_violations, 1);

        let current = registry.get("cam-01").unwrap();
        assert_eq!(current.connection_id, 2);
        assert_eq!(current.protocol_violations, 0);
        assert_eq!(registry.counts(), (1, 1));
    }

    #[test]
    fn test_superseded_close_is_ignored() {
        let registry = AgentRegistry::new();
        registry.register(session("cam-01", 1));
        registry.register(session("cam-01", 2));

        assert!(!registry.mark_disconnected("cam-01", 1));
        assert_eq!(
            registry.get("cam-01").unwrap().status,
            SessionStatus::Connected
        );

        assert!(registry.mark_disconnected("cam-01", 2));
        assert_eq!(
            registry.get("cam-01").unwrap().status,
            SessionStatus::Disconnected
        );
        // Record retained after disconnect
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn test_heartbeat_from_stale_connection() {
        let registry = AgentRegistry::new();
        registry.register(session("cam-01", 5));

        assert_eq!(
            registry.heartbeat("cam-01", 4, ConnectionState::Connected, None),
            HeartbeatOutcome::Stale
        );
        assert_eq!(
            registry.heartbeat("missing", 5, ConnectionState::Connected, None),
            HeartbeatOutcome::Stale
        );
        assert_eq!(
            registry.heartbeat("cam-01", 5, ConnectionState::Connected, None),
            HeartbeatOutcome::Updated
        );
        assert!(registry.get("cam-01").unwrap().last_heartbeat.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_uses_receipt_time() {
        let registry = AgentRegistry::new();
        registry.register(session("cam-01", 1));
        registry.register(session("cam-02", 2));
        let timeout = Duration::from_secs(60);

        tokio::time::advance(Duration::from_secs(30)).await;
        let stats = AgentStats {
            bytes_sent: 10,
            ..Default::default()
        };
        registry.heartbeat("cam-02", 2, ConnectionState::Connected, Some(stats));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(registry.expire_stale(timeout), vec!["cam-01".to_string()]);
        assert_eq!(registry.counts(), (2, 1));

        // Already disconnected sessions are not reported twice
        assert!(registry.expire_stale(timeout).is_empty());

        assert_eq!(
            registry.heartbeat("cam-01", 1, ConnectionState::Connected, None),
            HeartbeatOutcome::Revived
        );
        assert_eq!(registry.counts(), (2, 2));
        assert_eq!(registry.get("cam-02").unwrap().stats.bytes_sent, 10);
    }

    #[test]
    fn test_merge_status_keeps_stats_when_absent() {
        let registry = AgentRegistry::new();
        registry.register(session("cam-01", 1));
        let stats = AgentStats {
            reconnections: 3,
            ..Default::default()
        };
        assert!(registry.merge_status("cam-01", 1, ConnectionState::Connected, Some(stats)));
        assert!(registry.merge_status("cam-01", 1, ConnectionState::Reconnecting, None));

        let record = registry.get("cam-01").unwrap();
        assert_eq!(record.reported_state, ConnectionState::Reconnecting);
        assert_eq!(record.stats.reconnections, 3);
        assert!(!registry.merge_status("missing", 1, ConnectionState::Connected, None));
    }

    #[test]
    fn test_superseded_connection_cannot_merge_status() {
        let registry = AgentRegistry::new();
        registry.register(session("cam-01", 1));
        registry.register(session("cam-01", 2));

        assert!(!registry.merge_status("cam-01", 1, ConnectionState::Reconnecting, None));
        assert_eq!(
            registry.get("cam-01").unwrap().reported_state,
            ConnectionState::Connecting
        );
        assert!(registry.merge_status("cam-01", 2, ConnectionState::Connected, None));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_clears_tunnel_flag() {
        let registry = AgentRegistry::new();
        registry.register(session("cam-01", 1));
        registry.mark_tunnel("cam-01", true);

        tokio::time::advance(Duration::from_secs(61)).await;
        registry.expire_stale(Duration::from_secs(60));

        let record = registry.get("cam-01").unwrap();
        assert_eq!(record.status, SessionStatus::Disconnected);
        assert!(!record.tunnel_active);
    }

    #[test]
    fn test_stream_registry_counters() {
        let streams = StreamRegistry::new();
        streams.upsert("cam-01", 1, "rtsp://localhost:8554/cam-01".to_string(), StreamQuality::High);
        assert!(streams.record_frame("cam-01", 1, 100));
        assert!(streams.record_frame("cam-01", 1, 50));
        assert!(!streams.record_frame("missing", 1, 10));

        streams.viewer_joined("cam-01");
        streams.viewer_joined("cam-01");
        streams.viewer_left("cam-01");
        streams.set_active("cam-01", false);

        let stream = streams.get("cam-01").unwrap();
        assert_eq!(stream.frames_received, 2);
        assert_eq!(stream.bytes_received, 150);
        assert_eq!(stream.viewer_count, 1);
        assert!(!stream.active);
        assert_eq!(streams.counts(), (1, 0, 1));

        // Re-registration reactivates and keeps counters
        streams.upsert("cam-01", 2, "rtsp://localhost:8555/cam-01".to_string(), StreamQuality::Low);
        let stream = streams.get("cam-01").unwrap();
        assert!(stream.active);
        assert_eq!(stream.frames_received, 2);
        assert!(stream.url.contains("8555"));

        // Frames from the replaced publisher are not attributed
        assert!(!streams.record_frame("cam-01", 1, 10));
        assert_eq!(streams.get("cam-01").unwrap().frames_received, 2);
    }

    #[tokio::test]
    async fn test_concurrent_registrations_same_key() {
        let registry = AgentRegistry::new();
        let mut handles = Vec::new();
        for conn in 1..=32u64 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.register(session("cam-01", conn));
                registry.heartbeat("cam-01", conn, ConnectionState::Connected, None);
                registry.mark_disconnected("cam-01", conn);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(registry.list().len(), 1);
        let record = registry.get("cam-01").unwrap();
        assert!((1..=32).contains(&record.connection_id));
    }
}
