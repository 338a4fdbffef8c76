//! Signaling channels
//!
//! A signaling channel moves [`Signal`] records between nodes addressed by
//! Network ID. The relay WebSocket and the LAN broadcast variant expose the
//! same [`Signaling`] capability; the listener and dialer never distinguish
//! between them.

pub mod lan;
mod memory;
mod relay;

pub use lan::LanSignaling;
pub use memory::{MemoryNetwork, MemorySignaling};
pub use relay::RelaySignaling;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::network::NetworkError;
use crate::protocol::{Credentials, NetworkId, Signal};

/// Capability set shared by all signaling channels
#[async_trait]
pub trait Signaling: Send + Sync + 'static {
    /// Send a signal to the node named by `signal.network_id`
    async fn write_signal(&self, signal: &Signal) -> Result<(), NetworkError>;

    /// Wait for the next signal. `network_id` of the returned signal is the
    /// sender. Cancel-safe: dropping the future loses no signal.
    async fn read_signal(&self) -> Result<Signal, NetworkError>;

    /// ICE server credentials. Waits for the first value if none has been
    /// received yet; `None` means no TURN servers are available.
    async fn credentials(&self) -> Result<Option<Credentials>, NetworkError>;

    /// Network ID this node is reachable at
    fn network_id(&self) -> NetworkId;

    /// Close the channel. Pending reads fail with `SignalingClosed`.
    async fn close(&self);
}

/// Inbound signal queue with a sticky closed flag
pub(crate) struct Inbox {
    rx: Mutex<mpsc::UnboundedReceiver<Signal>>,
    closed: CancellationToken,
}

impl Inbox {
    pub(crate) fn new(closed: CancellationToken) -> (mpsc::UnboundedSender<Signal>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            tx,
            Self {
                rx: Mutex::new(rx),
                closed,
            },
        )
    }

    pub(crate) async fn recv(&self) -> Result<Signal, NetworkError> {
        // Both the lock and `recv` are cancel-safe
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(NetworkError::SignalingClosed),
            signal = async { self.rx.lock().await.recv().await } => {
                signal.ok_or(NetworkError::SignalingClosed)
            }
        }
    }
}

/// Credentials cell: unset until the first value, then the latest value
pub(crate) struct CredentialsCell {
    tx: watch::Sender<Option<Option<Credentials>>>,
}

impl CredentialsCell {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    pub(crate) fn set(&self, credentials: Option<Credentials>) {
        self.tx.send_replace(Some(credentials));
    }

    pub(crate) async fn get(
        &self,
        closed: &CancellationToken,
    ) -> Result<Option<Credentials>, NetworkError> {
        let mut rx = self.tx.subscribe();
        tokio::select! {
            biased;
            _ = closed.cancelled() => Err(NetworkError::SignalingClosed),
            value = rx.wait_for(Option::is_some) => match value {
                Ok(value) => Ok(value.clone().flatten()),
                Err(_) => Err(NetworkError::SignalingClosed),
            },
        }
    }
}
