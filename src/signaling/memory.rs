//! In-process signaling hub
//!
//! Nodes joined to the same [`MemoryNetwork`] exchange signals through
//! channels, addressed by Network ID like the relay would route them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Inbox, Signaling};
use crate::network::NetworkError;
use crate::protocol::{Credentials, NetworkId, Signal};

/// Routing table of an in-process signaling plane
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    nodes: Arc<Mutex<HashMap<NetworkId, mpsc::UnboundedSender<Signal>>>>,
    credentials: Option<Credentials>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Credentials handed to every node that joins afterwards
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Join the network as `network_id`
    pub fn join(&self, network_id: NetworkId) -> Result<MemorySignaling, NetworkError> {
        let closed = CancellationToken::new();
        let (tx, inbox) = Inbox::new(closed.clone());

        let mut nodes = self.nodes.lock();
        if nodes.contains_key(&network_id) {
            return Err(NetworkError::Signaling(format!(
                "network ID {} already joined",
                network_id
            )));
        }
        nodes.insert(network_id, tx);
        debug!("Node {} joined memory network", network_id);

        Ok(MemorySignaling {
            network: self.clone(),
            network_id,
            inbox,
            closed,
        })
    }

    /// Number of nodes currently joined
    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.lock().is_empty()
    }
}

/// One node of a [`MemoryNetwork`]
pub struct MemorySignaling {
    network: MemoryNetwork,
    network_id: NetworkId,
    inbox: Inbox,
    closed: CancellationToken,
}

#[async_trait]
impl Signaling for MemorySignaling {
    async fn write_signal(&self, signal: &Signal) -> Result<(), NetworkError> {
        if self.closed.is_cancelled() {
            return Err(NetworkError::SignalingClosed);
        }
        if signal.network_id == self.network_id {
            debug!("Dropping signal addressed to ourselves");
            return Ok(());
        }

        let recipient = self.network.nodes.lock().get(&signal.network_id).cloned();
        match recipient {
            Some(tx) => {
                let mut delivered = signal.clone();
                delivered.network_id = self.network_id;
                if tx.send(delivered).is_err() {
                    warn!("Node {} is gone, signal dropped", signal.network_id);
                }
            }
            None => warn!("No node {} on memory network, signal dropped", signal.network_id),
        }
        Ok(())
    }

    async fn read_signal(&self) -> Result<Signal, NetworkError> {
        self.inbox.recv().await
    }

    async fn credentials(&self) -> Result<Option<Credentials>, NetworkError> {
        if self.closed.is_cancelled() {
            return Err(NetworkError::SignalingClosed);
        }
        Ok(self.network.credentials.clone())
    }

    fn network_id(&self) -> NetworkId {
        self.network_id
    }

    async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        self.network.nodes.lock().remove(&self.network_id);
        debug!("Node {} left memory network", self.network_id);
    }
}

impl Drop for MemorySignaling {
    fn drop(&mut self) {
        if !self.closed.is_cancelled() {
            self.closed.cancel();
            self.network.nodes.lock().remove(&self.network_id);
        }
    }
}
