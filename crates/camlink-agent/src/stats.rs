//! Session counters shared between the stream, monitor and command loops

use camlink_proto::AgentStats;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Default)]
pub struct SessionStats {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_lost: AtomicU64,
    frames_dropped: AtomicU64,
    reconnections: AtomicU64,
    started_at: Mutex<Option<Instant>>,
}

impl SessionStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin the uptime clock; later calls keep the first start
    pub fn mark_started(&self) {
        if let Ok(mut started) = self.started_at.lock() {
            started.get_or_insert_with(Instant::now);
        }
    }

    pub fn add_bytes_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_packet_lost(&self) {
        self.packets_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_frames_dropped(&self, n: u64) {
        if n > 0 {
            self.frames_dropped.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn add_reconnection(&self) -> u64 {
        self.reconnections.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn reconnections(&self) -> u64 {
        self.reconnections.load(Ordering::SeqCst)
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at
            .lock()
            .ok()
            .and_then(|started| started.map(|at| at.elapsed().as_secs()))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> AgentStats {
        AgentStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_lost: self.packets_lost.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            reconnections: self.reconnections.load(Ordering::SeqCst),
            uptime_secs: self.uptime_secs(),
        }
    }
}
