//! Pumps relay streams between the broker and the local camera

use crate::channel::{ChannelError, Outbound};
use crate::config::CameraEndpoint;
use crate::stats::SessionStats;
use camlink_proto::AgentMessage;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn, Instrument};

#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("Failed to connect to camera {address}: {source}")]
    ConnectionFailed {
        address: String,
        source: std::io::Error,
    },

    #[error("Timed out connecting to camera {0}")]
    Timeout(String),

    #[error("IO error during forwarding: {0}")]
    Io(#[from] std::io::Error),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
}

/// Which side ended a relay stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEnd {
    Camera,
    Relay,
}

pub struct CameraForwarder {
    camera: CameraEndpoint,
    connect_timeout: Duration,
    outbound: Outbound,
    stats: Arc<SessionStats>,
    streams: Arc<Mutex<HashMap<u32, mpsc::Sender<Vec<u8>>>>>,
}

impl CameraForwarder {
    pub(crate) fn new(
        camera: CameraEndpoint,
        connect_timeout: Duration,
        outbound: Outbound,
        stats: Arc<SessionStats>,
    ) -> Self {
        Self {
            camera,
            connect_timeout,
            outbound,
            stats,
            streams: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn open_streams(&self) -> usize {
        self.streams.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Start forwarding a viewer stream to the camera
    ///
    /// Viewer bytes that arrive before the camera connection is up are queued.
    pub fn open(&self, stream_id: u32) {
        let (tx, rx) = mpsc::channel(64);
        if let Ok(mut streams) = self.streams.lock() {
            if streams.insert(stream_id, tx).is_some() {
                warn!(stream_id = stream_id, "Relay stream reopened, dropping previous");
            }
        }

        let address = self.camera.address();
        let timeout = self.connect_timeout;
        let outbound = self.outbound.clone();
        let stats = self.stats.clone();
        let streams = self.streams.clone();

        tokio::spawn(
            async move {
                let reason = match pump(&address, timeout, stream_id, rx, &outbound, &stats).await
                {
                    Ok(StreamEnd::Relay) => None,
                    Ok(StreamEnd::Camera) => Some("camera closed the connection".to_string()),
                    Err(e) => {
                        warn!(stream_id = stream_id, error = %e, "Relay stream failed");
                        Some(e.to_string())
                    }
                };

                // Broker-initiated closes already removed the entry
                if let Some(reason) = reason {
                    if let Ok(mut streams) = streams.lock() {
                        streams.remove(&stream_id);
                    }
                    let close = AgentMessage::RelayClose {
                        stream_id,
                        reason: Some(reason),
                    };
                    if let Err(e) = outbound.send(&close).await {
                        debug!(stream_id = stream_id, error = %e, "Could not report relay close");
                    }
                }
            }
            .in_current_span(),
        );
    }

    /// Queue viewer bytes for the camera
    pub async fn write(&self, stream_id: u32, data: Vec<u8>) {
        let tx = self
            .streams
            .lock()
            .ok()
            .and_then(|streams| streams.get(&stream_id).cloned());

        match tx {
            Some(tx) => {
                if tx.send(data).await.is_err() {
                    debug!(stream_id = stream_id, "Relay stream already finished");
                }
            }
            None => debug!(stream_id = stream_id, "Relay data for unknown stream"),
        }
    }

    pub fn close(&self, stream_id: u32, reason: Option<&str>) {
        let removed = self
            .streams
            .lock()
            .ok()
            .and_then(|mut streams| streams.remove(&stream_id));
        if removed.is_some() {
            debug!(stream_id = stream_id, reason = ?reason, "Relay stream closed by broker");
        }
    }

    pub fn close_all(&self) {
        if let Ok(mut streams) = self.streams.lock() {
            streams.clear();
        }
    }
}

async fn pump(
    address: &str,
    timeout: Duration,
    stream_id: u32,
    mut inbound: mpsc::Receiver<Vec<u8>>,
    outbound: &Outbound,
    stats: &SessionStats,
) -> Result<StreamEnd, ForwardError> {
    let mut camera = tokio::time::timeout(timeout, TcpStream::connect(address))
        .await
        .map_err(|_| ForwardError::Timeout(address.to_string()))?
        .map_err(|e| ForwardError::ConnectionFailed {
            address: address.to_string(),
            source: e,
        })?;

    debug!(stream_id = stream_id, camera = %address, "Connected to camera");

    let (mut camera_read, mut camera_write) = camera.split();
    let mut buf = vec![0u8; 16 * 1024];
    let mut to_camera = 0u64;
    let mut to_relay = 0u64;

    let end = loop {
        tokio::select! {
            data = inbound.recv() => match data {
                Some(data) => {
                    camera_write.write_all(&data).await?;
                    to_camera += data.len() as u64;
                }
                None => break StreamEnd::Relay,
            },
            read = camera_read.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    break StreamEnd::Camera;
                }
                outbound
                    .send_data(&AgentMessage::RelayData {
                        stream_id,
                        data: buf[..n].to_vec(),
                    })
                    .await?;
                stats.add_bytes_sent(n as u64);
                to_relay += n as u64;
            }
        }
    };

    info!(
        stream_id = stream_id,
        bytes_to_camera = to_camera,
        bytes_to_relay = to_relay,
        "Relay stream finished"
    );

    Ok(end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use camlink_proto::MessageCodec;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    async fn next_agent_message(rx: &mut mpsc::Receiver<Message>) -> AgentMessage {
        match rx.recv().await {
            Some(Message::Text(text)) => MessageCodec::decode(&text).unwrap(),
            other => panic!("Expected text frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_relay_round_trip_through_camera() {
        // Echo server standing in for the camera
        let camera = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = camera.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = camera.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(&buf[..n]).await.unwrap();
        });

        let (tx, mut rx) = mpsc::channel(16);
        let stats = Arc::new(SessionStats::new());
        let forwarder = CameraForwarder::new(
            CameraEndpoint {
                ip: "127.0.0.1".to_string(),
                port,
            },
            Duration::from_secs(5),
            Outbound::new(tx.clone(), tx),
            stats.clone(),
        );

        forwarder.open(3);
        forwarder.write(3, b"OPTIONS rtsp://cam RTSP/1.0\r\n".to_vec()).await;

        match next_agent_message(&mut rx).await {
            AgentMessage::RelayData { stream_id, data } => {
                assert_eq!(stream_id, 3);
                assert_eq!(data, b"OPTIONS rtsp://cam RTSP/1.0\r\n".to_vec());
            }
            other => panic!("Expected RelayData, got {:?}", other),
        }

        // Echo server hangs up after one exchange
        match next_agent_message(&mut rx).await {
            AgentMessage::RelayClose { stream_id, reason } => {
                assert_eq!(stream_id, 3);
                assert!(reason.is_some());
            }
            other => panic!("Expected RelayClose, got {:?}", other),
        }
        assert_eq!(forwarder.open_streams(), 0);
        assert!(stats.snapshot().bytes_sent > 0);
    }

    #[tokio::test]
    async fn test_unreachable_camera_reports_close() {
        // Grab a free port, then release it so nothing listens there
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let (tx, mut rx) = mpsc::channel(16);
        let forwarder = CameraForwarder::new(
            CameraEndpoint {
                ip: "127.0.0.1".to_string(),
                port,
            },
            Duration::from_secs(5),
            Outbound::new(tx.clone(), tx),
            Arc::new(SessionStats::new()),
        );

        forwarder.open(9);

        match next_agent_message(&mut rx).await {
            AgentMessage::RelayClose { stream_id, reason } => {
                assert_eq!(stream_id, 9);
                assert!(reason.unwrap().contains("camera"));
            }
            other => panic!("Expected RelayClose, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_broker_close_is_not_echoed() {
        let camera = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = camera.local_addr().unwrap().port();
        let (accepted_tx, accepted_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (socket, _) = camera.accept().await.unwrap();
            let _ = accepted_tx.send(());
            // Hold the socket open until the test ends
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        });

        let (tx, mut rx) = mpsc::channel(16);
        let forwarder = CameraForwarder::new(
            CameraEndpoint {
                ip: "127.0.0.1".to_string(),
                port,
            },
            Duration::from_secs(5),
            Outbound::new(tx.clone(), tx),
            Arc::new(SessionStats::new()),
        );

        forwarder.open(1);
        accepted_rx.await.unwrap();
        forwarder.close(1, Some("viewer left"));
        assert_eq!(forwarder.open_streams(), 0);

        let nothing = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(nothing.is_err(), "No relay_close expected, got {:?}", nothing);
    }
}
