//! Peer connection
//!
//! A [`Conn`] is created by the listener or dialer once both data channels of
//! a negotiation are open. A driver task owns the transport event queue and
//! the reassembly buffer; the `Conn` handle only reads finished messages and
//! writes frames.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::NetworkError;
use super::framing::{fragment, Reassembler, MAX_MESSAGE_SIZE};
use super::transport::{ChannelEvent, ChannelKind, DataChannel, DataChannels, Role, TransportStack};
use crate::protocol::{ConnectionId, IceCandidate, NetworkId};

/// Lifecycle of a peer connection. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum ConnState {
    /// Collecting local candidates
    #[default]
    Gathering = 0,
    /// Offer or answer sent, waiting for the remote side
    Negotiating = 1,
    /// ICE, DTLS and SCTP starting
    Connecting = 2,
    /// Both data channels open
    Open = 3,
    Closed = 4,
}

impl ConnState {
    /// Convert from u8 value
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Gathering,
            1 => Self::Negotiating,
            2 => Self::Connecting,
            3 => Self::Open,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Gathering => "gathering",
            Self::Negotiating => "negotiating",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Informational address of one end of a peer connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Addr {
    pub network_id: NetworkId,
    pub connection_id: ConnectionId,
    pub candidates: Vec<IceCandidate>,
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network_id, self.connection_id)
    }
}

/// State shared between the negotiating task, the driver and the handle
pub(crate) struct PeerState {
    pub(crate) connection_id: ConnectionId,
    pub(crate) role: Role,
    pub(crate) local_network_id: NetworkId,
    pub(crate) remote_network_id: NetworkId,
    state: AtomicU8,
    last_error: Mutex<Option<String>>,
    local_candidates: Mutex<Vec<IceCandidate>>,
    remote_candidates: Mutex<Vec<IceCandidate>>,
    /// Sticky closed signal
    pub(crate) closed: CancellationToken,
    /// Set once the transports have been released
    released: CancellationToken,
}

impl PeerState {
    pub(crate) fn new(
        role: Role,
        connection_id: ConnectionId,
        local_network_id: NetworkId,
        remote_network_id: NetworkId,
        closed: CancellationToken,
    ) -> Self {
        Self {
            connection_id,
            role,
            local_network_id,
            remote_network_id,
            state: AtomicU8::new(ConnState::Gathering as u8),
            last_error: Mutex::new(None),
            local_candidates: Mutex::new(Vec::new()),
            remote_candidates: Mutex::new(Vec::new()),
            closed,
            released: CancellationToken::new(),
        }
    }

    pub(crate) fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Move forward to `state`. Backward transitions are ignored.
    pub(crate) fn advance(&self, state: ConnState) {
        let previous = ConnState::from_u8(self.state.fetch_max(state as u8, Ordering::SeqCst));
        if previous < state {
            debug!(
                "Connection {} ({:?}): {} -> {}",
                self.connection_id, self.role, previous, state
            );
        }
    }

    /// Record the first failure and close
    pub(crate) fn fail(&self, error: &NetworkError) {
        {
            let mut last_error = self.last_error.lock();
            if last_error.is_none() {
                *last_error = Some(error.to_string());
            }
        }
        self.shutdown();
    }

    pub(crate) fn shutdown(&self) {
        self.advance(ConnState::Closed);
        self.closed.cancel();
    }

    /// Mark the transports as released. Concurrent `close` calls return.
    pub(crate) fn mark_released(&self) {
        self.shutdown();
        self.released.cancel();
    }

    pub(crate) fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub(crate) fn set_local_candidates(&self, candidates: Vec<IceCandidate>) {
        *self.local_candidates.lock() = candidates;
    }

    pub(crate) fn push_remote_candidate(&self, candidate: IceCandidate) {
        self.remote_candidates.lock().push(candidate);
    }

    fn local_addr(&self) -> Addr {
        Addr {
            network_id: self.local_network_id,
            connection_id: self.connection_id,
            candidates: self.local_candidates.lock().clone(),
        }
    }

    fn remote_addr(&self) -> Addr {
        Addr {
            network_id: self.remote_network_id,
            connection_id: self.connection_id,
            candidates: self.remote_candidates.lock().clone(),
        }
    }
}

/// An open peer connection carrying a reliable message stream
pub struct Conn {
    peer: Arc<PeerState>,
    reliable: Box<dyn DataChannel>,
    unreliable: Box<dyn DataChannel>,
    /// max-message-size advertised by the remote description
    remote_max_message_size: usize,
    messages: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    datagrams: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    /// Keeps the frames of one message contiguous
    write_lock: tokio::sync::Mutex<()>,
}

impl Conn {
    /// Take over a started stack and spawn its driver task
    pub(crate) fn spawn(
        peer: Arc<PeerState>,
        stack: Arc<dyn TransportStack>,
        channels: DataChannels,
        remote_max_message_size: u32,
    ) -> Self {
        let DataChannels {
            reliable,
            unreliable,
            events,
        } = channels;
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        let (datagrams_tx, datagrams_rx) = mpsc::unbounded_channel();

        peer.advance(ConnState::Open);
        info!(
            "Connection {} open between {} and {}",
            peer.connection_id, peer.local_network_id, peer.remote_network_id
        );

        tokio::spawn(drive(
            peer.clone(),
            stack,
            events,
            messages_tx,
            datagrams_tx,
        ));

        Self {
            peer,
            reliable,
            unreliable,
            remote_max_message_size: remote_max_message_size as usize,
            messages: tokio::sync::Mutex::new(messages_rx),
            datagrams: tokio::sync::Mutex::new(datagrams_rx),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Next reassembled message from the reliable channel
    pub async fn read_message(&self) -> Result<Bytes, NetworkError> {
        let mut messages = self.messages.lock().await;
        tokio::select! {
            biased;
            message = messages.recv() => message.ok_or(NetworkError::ConnectionClosed),
            _ = self.peer.closed.cancelled() => Err(NetworkError::ConnectionClosed),
        }
    }

    /// Fragment `message` and write it to the reliable channel
    pub async fn write_message(&self, message: &[u8]) -> Result<usize, NetworkError> {
        if message.len() > MAX_MESSAGE_SIZE {
            return Err(NetworkError::MessageTooLarge(message.len()));
        }
        if self.peer.closed.is_cancelled() {
            return Err(NetworkError::ConnectionClosed);
        }

        let _guard = self.write_lock.lock().await;
        for frame in fragment(message) {
            let sent = tokio::select! {
                biased;
                _ = self.peer.closed.cancelled() => return Err(NetworkError::ConnectionClosed),
                sent = self.reliable.send(frame) => sent,
            };
            if let Err(e) = sent {
                warn!("Connection {}: reliable send failed: {}", self.peer.connection_id, e);
                self.peer.fail(&NetworkError::ConnectionClosed);
                return Err(NetworkError::ConnectionClosed);
            }
        }
        Ok(message.len())
    }

    /// Send one unframed datagram on the unreliable channel
    pub async fn write_unreliable(&self, datagram: &[u8]) -> Result<usize, NetworkError> {
        if datagram.len() > self.remote_max_message_size {
            return Err(NetworkError::MessageTooLarge(datagram.len()));
        }
        if self.peer.closed.is_cancelled() {
            return Err(NetworkError::ConnectionClosed);
        }
        self.unreliable
            .send(Bytes::copy_from_slice(datagram))
            .await
            .map_err(|_| NetworkError::ConnectionClosed)
    }

    /// Next datagram received on the unreliable channel
    pub async fn read_unreliable(&self) -> Result<Bytes, NetworkError> {
        let mut datagrams = self.datagrams.lock().await;
        tokio::select! {
            biased;
            datagram = datagrams.recv() => datagram.ok_or(NetworkError::ConnectionClosed),
            _ = self.peer.closed.cancelled() => Err(NetworkError::ConnectionClosed),
        }
    }

    pub fn state(&self) -> ConnState {
        self.peer.state()
    }

    /// Error that closed the connection, if it did not close cleanly
    pub fn last_error(&self) -> Option<String> {
        self.peer.last_error()
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.peer.connection_id
    }

    pub fn role(&self) -> Role {
        self.peer.role
    }

    pub fn remote_network_id(&self) -> NetworkId {
        self.peer.remote_network_id
    }

    pub fn local_addr(&self) -> Addr {
        self.peer.local_addr()
    }

    pub fn remote_addr(&self) -> Addr {
        self.peer.remote_addr()
    }

    pub fn set_deadline(&self, _deadline: Instant) -> Result<(), NetworkError> {
        Err(NetworkError::NotImplemented)
    }

    pub fn set_read_deadline(&self, _deadline: Instant) -> Result<(), NetworkError> {
        Err(NetworkError::NotImplemented)
    }

    pub fn set_write_deadline(&self, _deadline: Instant) -> Result<(), NetworkError> {
        Err(NetworkError::NotImplemented)
    }

    /// Resolves once the connection is closed, locally or by the remote
    pub async fn closed(&self) {
        self.peer.closed.cancelled().await
    }

    /// Close the connection and wait until its transports are released.
    /// Idempotent.
    pub async fn close(&self) {
        self.peer.shutdown();
        self.peer.released.cancelled().await;
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        self.peer.shutdown();
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("connection_id", &self.peer.connection_id)
            .field("role", &self.peer.role)
            .field("local", &self.peer.local_network_id)
            .field("remote", &self.peer.remote_network_id)
            .field("state", &self.state())
            .finish()
    }
}

/// Driver task: owns the reassembly buffer and the transport stack
async fn drive(
    peer: Arc<PeerState>,
    stack: Arc<dyn TransportStack>,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    messages: mpsc::UnboundedSender<Bytes>,
    datagrams: mpsc::UnboundedSender<Bytes>,
) {
    let mut reassembler = Reassembler::new();

    loop {
        let event = tokio::select! {
            biased;
            _ = peer.closed.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Some(ChannelEvent::Message {
                kind: ChannelKind::Reliable,
                data,
            }) => match reassembler.push(&data) {
                Ok(Some(message)) => {
                    let _ = messages.send(message);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Connection {}: {}", peer.connection_id, e);
                    peer.fail(&NetworkError::Reassembly(e));
                    break;
                }
            },
            Some(ChannelEvent::Message {
                kind: ChannelKind::Unreliable,
                data,
            }) => {
                let _ = datagrams.send(data);
            }
            Some(ChannelEvent::Closed(kind)) => {
                debug!("Connection {}: {} closed by remote", peer.connection_id, kind.label());
                if kind == ChannelKind::Reliable {
                    break;
                }
            }
            None => break,
        }
    }

    peer.shutdown();
    stack.close().await;
    peer.mark_released();
    info!("Connection {} closed", peer.connection_id);
}
