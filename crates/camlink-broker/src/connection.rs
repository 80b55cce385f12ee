//! Live agent connections and control command routing

use crate::error::BrokerError;
use camlink_proto::ControlMessage;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct AgentLink {
    connection_id: u64,
    sender: mpsc::Sender<ControlMessage>,
}

/// Maps agent ids to the outbound queue of their current connection
#[derive(Debug, Clone, Default)]
pub struct AgentConnectionManager {
    links: Arc<RwLock<HashMap<String, AgentLink>>>,
    generation: Arc<AtomicU64>,
}

impl AgentConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the generation for a freshly accepted connection
    pub fn next_connection_id(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Install `sender` as the live link, replacing any previous connection
    pub async fn register(
        &self,
        agent_id: &str,
        connection_id: u64,
        sender: mpsc::Sender<ControlMessage>,
    ) {
        let previous = self.links.write().await.insert(
            agent_id.to_string(),
            AgentLink {
                connection_id,
                sender,
            },
        );
        match previous {
            Some(old) => info!(
                agent_id = %agent_id,
                connection_id,
                replaced = old.connection_id,
                "Agent link replaced"
            ),
            None => debug!(agent_id = %agent_id, connection_id, "Agent link registered"),
        }
    }

    /// Drop the link only if it still belongs to `connection_id`
    pub async fn unregister(&self, agent_id: &str, connection_id: u64) -> bool {
        let mut links = self.links.write().await;
        match links.get(agent_id) {
            Some(link) if link.connection_id == connection_id => {
                links.remove(agent_id);
                debug!(agent_id = %agent_id, connection_id, "Agent link removed");
                true
            }
            _ => false,
        }
    }

    /// Queue a control message for the agent's live connection
    pub async fn send(&self, agent_id: &str, message: ControlMessage) -> Result<(), BrokerError> {
        let sender = {
            let links = self.links.read().await;
            links
                .get(agent_id)
                .map(|link| link.sender.clone())
                .ok_or_else(|| BrokerError::NotConnected(agent_id.to_string()))?
        };

        sender
            .send(message)
            .await
            .map_err(|_| BrokerError::NotConnected(agent_id.to_string()))
    }

    pub async fn is_connected(&self, agent_id: &str) -> bool {
        self.links
            .read()
            .await
            .get(agent_id)
            .is_some_and(|link| !link.sender.is_closed())
    }

    pub async fn connected_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.links.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}
