//! Relay ports: per-agent TCP listeners that carry viewer traffic over the agent link
//!
//! A viewer connecting to an agent's relay port gets a `stream_id`; its bytes
//! travel to the agent as `relay_data` and come back the same way. The relay
//! never connects to the camera directly.

use crate::config::PortRange;
use crate::connection::AgentConnectionManager;
use crate::error::BrokerError;
use crate::registry::StreamRegistry;
use camlink_proto::ControlMessage;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const VIEWER_QUEUE: usize = 64;
const READ_CHUNK: usize = 16 * 1024;

/// Binds relay ports to agent identities
pub trait PortAllocator: Send + Sync {
    /// Port for `agent_id`, reusing a previous allocation when there is one
    ///
    /// Returning 0 asks the OS for a port; the bound port is reported back
    /// through [`PortAllocator::confirm`].
    fn allocate(&self, agent_id: &str, requested_port: Option<u16>) -> Result<u16, BrokerError>;
    fn confirm(&self, _agent_id: &str, _port: u16) {}
    fn deallocate(&self, agent_id: &str);
    fn get_allocated_port(&self, agent_id: &str) -> Option<u16>;
}

fn is_port_available(ip: IpAddr, port: u16) -> bool {
    std::net::TcpListener::bind((ip, port)).is_ok()
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Hands out ports from an inclusive range
pub struct RangePortAllocator {
    bind_ip: IpAddr,
    range: PortRange,
    allocations: Mutex<HashMap<String, u16>>,
}

impl RangePortAllocator {
    pub fn new(bind_ip: IpAddr, range: PortRange) -> Self {
        Self {
            bind_ip,
            range,
            allocations: Mutex::new(HashMap::new()),
        }
    }
}

impl PortAllocator for RangePortAllocator {
    fn allocate(&self, agent_id: &str, requested_port: Option<u16>) -> Result<u16, BrokerError> {
        let mut allocations = lock(&self.allocations);

        if let Some(&port) = allocations.get(agent_id) {
            return Ok(port);
        }

        let taken: HashSet<u16> = allocations.values().copied().collect();
        let usable = |port: u16| !taken.contains(&port) && is_port_available(self.bind_ip, port);

        let port = requested_port
            .filter(|port| self.range.contains(*port) && usable(*port))
            .or_else(|| (self.range.start..=self.range.end).find(|port| usable(*port)))
            .ok_or(BrokerError::PortExhausted {
                start: self.range.start,
                end: self.range.end,
            })?;

        allocations.insert(agent_id.to_string(), port);
        Ok(port)
    }

    fn deallocate(&self, agent_id: &str) {
        lock(&self.allocations).remove(agent_id);
    }

    fn get_allocated_port(&self, agent_id: &str) -> Option<u16> {
        lock(&self.allocations).get(agent_id).copied()
    }
}

/// Lets the OS choose ports, remembering them for reconnect reuse
#[derive(Default)]
pub struct EphemeralPortAllocator {
    allocations: Mutex<HashMap<String, u16>>,
}

impl PortAllocator for EphemeralPortAllocator {
    fn allocate(&self, agent_id: &str, _requested_port: Option<u16>) -> Result<u16, BrokerError> {
        Ok(lock(&self.allocations).get(agent_id).copied().unwrap_or(0))
    }

    fn confirm(&self, agent_id: &str, port: u16) {
        lock(&self.allocations).insert(agent_id.to_string(), port);
    }

    fn deallocate(&self, agent_id: &str) {
        lock(&self.allocations).remove(agent_id);
    }

    fn get_allocated_port(&self, agent_id: &str) -> Option<u16> {
        lock(&self.allocations).get(agent_id).copied()
    }
}

#[derive(Clone, Default)]
struct StreamIdGenerator {
    next: Arc<AtomicU32>,
}

impl StreamIdGenerator {
    fn generate(&self) -> u32 {
        self.next.fetch_add(1, Ordering::SeqCst) + 1
    }
}

struct Relay {
    port: u16,
    /// Connection generation that reserved the port
    owner: u64,
    /// Bound at registration, handed to the accept loop by `open`
    listener: Option<TcpListener>,
    task: Option<JoinHandle<()>>,
}

impl Relay {
    async fn shutdown(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

struct Viewer {
    agent_id: String,
    tx: mpsc::Sender<Vec<u8>>,
}

#[derive(Clone)]
pub struct RelayManager {
    bind_ip: IpAddr,
    allocator: Arc<dyn PortAllocator>,
    relays: Arc<tokio::sync::Mutex<HashMap<String, Relay>>>,
    viewers: Arc<DashMap<u32, Viewer>>,
    stream_ids: StreamIdGenerator,
    connections: AgentConnectionManager,
    streams: StreamRegistry,
}

impl RelayManager {
    pub fn new(
        bind_ip: IpAddr,
        allocator: Arc<dyn PortAllocator>,
        connections: AgentConnectionManager,
        streams: StreamRegistry,
    ) -> Self {
        Self {
            bind_ip,
            allocator,
            relays: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            viewers: Arc::new(DashMap::new()),
            stream_ids: StreamIdGenerator::default(),
            connections,
            streams,
        }
    }

    /// Allocate and bind the relay port for an agent
    ///
    /// A previous relay for the same agent is torn down first so its port can
    /// be rebound.
    pub async fn reserve(
        &self,
        agent_id: &str,
        connection_id: u64,
        hint: Option<u16>,
    ) -> Result<u16, BrokerError> {
        let mut relays = self.relays.lock().await;
        if let Some(old) = relays.remove(agent_id) {
            debug!(agent_id = %agent_id, port = old.port, "Replacing existing relay");
            old.shutdown().await;
            self.drop_viewers(agent_id);
        }

        let port = self.allocator.allocate(agent_id, hint)?;
        let listener = match self.bind_with_retry(port).await {
            Ok(listener) => listener,
            Err(e) => {
                self.allocator.deallocate(agent_id);
                return Err(e);
            }
        };
        let port = listener.local_addr()?.port();
        self.allocator.confirm(agent_id, port);

        relays.insert(
            agent_id.to_string(),
            Relay {
                port,
                owner: connection_id,
                listener: Some(listener),
                task: None,
            },
        );
        Ok(port)
    }

    async fn bind_with_retry(&self, port: u16) -> Result<TcpListener, BrokerError> {
        let addr = SocketAddr::new(self.bind_ip, port);
        let mut attempt = 1;
        loop {
            match TcpListener::bind(addr).await {
                Ok(listener) => return Ok(listener),
                // A just-closed relay can hold the port briefly
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && attempt < 3 => {
                    warn!(
                        "Relay port {} is in use (attempt {}/3), retrying",
                        port, attempt
                    );
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                Err(source) => {
                    return Err(BrokerError::Bind {
                        addr: addr.to_string(),
                        source,
                    })
                }
            }
        }
    }

    /// Start accepting viewers on the agent's reserved port
    pub async fn open(&self, agent_id: &str) -> Result<u16, BrokerError> {
        let mut relays = self.relays.lock().await;
        let relay = relays
            .get_mut(agent_id)
            .ok_or_else(|| BrokerError::AgentNotFound(agent_id.to_string()))?;

        if let Some(listener) = relay.listener.take() {
            info!(agent_id = %agent_id, port = relay.port, "Relay listening for viewers");
            let manager = self.clone();
            let agent_id = agent_id.to_string();
            relay.task = Some(tokio::spawn(async move {
                manager.accept_loop(agent_id, listener).await;
            }));
        }
        Ok(relay.port)
    }

    /// Stop the relay listener and drop every viewer of the agent
    ///
    /// Only the connection that reserved the relay can close it.
    pub async fn close(&self, agent_id: &str, connection_id: u64) -> bool {
        let relay = {
            let mut relays = self.relays.lock().await;
            match relays.get(agent_id) {
                Some(relay) if relay.owner == connection_id => relays.remove(agent_id),
                _ => None,
            }
        };
        let Some(relay) = relay else {
            return false;
        };

        info!(agent_id = %agent_id, port = relay.port, "Relay closed");
        relay.shutdown().await;
        self.drop_viewers(agent_id);
        true
    }

    /// Pass agent bytes to a viewer
    pub async fn deliver(&self, agent_id: &str, stream_id: u32, data: Vec<u8>) -> bool {
        let tx = match self.viewers.get(&stream_id) {
            Some(viewer) if viewer.agent_id == agent_id => viewer.tx.clone(),
            _ => return false,
        };
        tx.send(data).await.is_ok()
    }

    /// The agent closed its side of a stream
    pub fn close_viewer(&self, agent_id: &str, stream_id: u32) -> bool {
        self.viewers
            .remove_if(&stream_id, |_, viewer| viewer.agent_id == agent_id)
            .is_some()
    }

    pub fn open_viewers(&self) -> usize {
        self.viewers.len()
    }

    fn drop_viewers(&self, agent_id: &str) {
        self.viewers.retain(|_, viewer| viewer.agent_id != agent_id);
    }

    async fn accept_loop(self, agent_id: String, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    if !self.connections.is_connected(&agent_id).await {
                        warn!(
                            agent_id = %agent_id,
                            peer = %peer_addr,
                            "Dropping viewer, agent is not connected"
                        );
                        continue;
                    }

                    let stream_id = self.stream_ids.generate();
                    let (tx, rx) = mpsc::channel(VIEWER_QUEUE);
                    self.viewers.insert(
                        stream_id,
                        Viewer {
                            agent_id: agent_id.clone(),
                            tx,
                        },
                    );
                    self.streams.viewer_joined(&agent_id);

                    if let Err(e) = self
                        .connections
                        .send(&agent_id, ControlMessage::RelayOpen { stream_id })
                        .await
                    {
                        warn!(agent_id = %agent_id, stream_id, "Failed to open relay stream: {}", e);
                        self.viewers.remove(&stream_id);
                        self.streams.viewer_left(&agent_id);
                        continue;
                    }

                    debug!(agent_id = %agent_id, stream_id, peer = %peer_addr, "Viewer attached");
                    let manager = self.clone();
                    let agent_id = agent_id.clone();
                    tokio::spawn(async move {
                        manager.pump_viewer(agent_id, stream_id, socket, rx).await;
                    });
                }
                Err(e) => {
                    error!(agent_id = %agent_id, "Failed to accept viewer: {}", e);
                }
            }
        }
    }

    async fn pump_viewer(
        self,
        agent_id: String,
        stream_id: u32,
        socket: TcpStream,
        mut rx: mpsc::Receiver<Vec<u8>>,
    ) {
        let (mut reader, mut writer) = socket.into_split();
        let mut buf = vec![0u8; READ_CHUNK];

        loop {
            tokio::select! {
                read = reader.read(&mut buf) => match read {
                    Ok(0) | Err(_) => {
                        self.notify_close(&agent_id, stream_id, "viewer disconnected").await;
                        break;
                    }
                    Ok(n) => {
                        let message = ControlMessage::RelayData {
                            stream_id,
                            data: buf[..n].to_vec(),
                        };
                        if self.connections.send(&agent_id, message).await.is_err() {
                            break;
                        }
                    }
                },
                outbound = rx.recv() => match outbound {
                    Some(data) => {
                        if let Err(e) = writer.write_all(&data).await {
                            debug!(stream_id, "Viewer write failed: {}", e);
                            self.notify_close(&agent_id, stream_id, "viewer write failed").await;
                            break;
                        }
                    }
                    // Closed by the agent or by relay teardown
                    None => break,
                },
            }
        }

        let _ = writer.shutdown().await;
        self.viewers.remove(&stream_id);
        self.streams.viewer_left(&agent_id);
        debug!(agent_id = %agent_id, stream_id, "Viewer detached");
    }

    async fn notify_close(&self, agent_id: &str, stream_id: u32, reason: &str) {
        let message = ControlMessage::RelayClose {
            stream_id,
            reason: Some(reason.to_string()),
        };
        let _ = self.connections.send(agent_id, message).await;
    }
}
