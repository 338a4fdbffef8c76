//! LAN discovery signaling
//!
//! One UDP socket on the discovery port (7551 by default) does three jobs:
//! it broadcasts a `Request` every interval, answers `Request`s with the
//! published server data, and carries signals as `Message` packets to peers
//! whose address was learned from earlier traffic. Addresses unheard from
//! for the configured TTL are forgotten. All datagrams are encrypted and
//! signed, see [`crypto`].

pub mod crypto;
pub mod packet;

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use self::packet::{Packet, MAX_MESSAGE_SIZE};
use super::{Inbox, Signaling};
use crate::config::LanConfig;
use crate::network::{NetworkError, Publisher};
use crate::protocol::{Credentials, NetworkId, Signal};

/// Body of keep-alive messages
const PING: &str = "Ping";

/// Largest datagram read from the socket
const RECV_BUFFER_SIZE: usize = 65_536;

/// Signaling over LAN broadcast
pub struct LanSignaling {
    shared: Arc<Shared>,
    inbox: Inbox,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct Shared {
    network_id: NetworkId,
    socket: UdpSocket,
    broadcast_addr: SocketAddr,
    local_ip: Option<IpAddr>,
    address_ttl: Duration,
    addresses: Mutex<HashMap<NetworkId, PeerAddress>>,
    responses: Mutex<HashMap<NetworkId, Bytes>>,
    server_data: Mutex<Option<Bytes>>,
    closed: CancellationToken,
}

#[derive(Debug, Clone, Copy)]
struct PeerAddress {
    addr: SocketAddr,
    last_seen: Instant,
}

/// Bind the discovery socket with SO_REUSEADDR and SO_BROADCAST
fn bind_socket(addr: SocketAddr) -> Result<UdpSocket, NetworkError> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

    // Several games on one host share the discovery port
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

impl LanSignaling {
    /// Bind the discovery socket and start broadcasting requests
    pub async fn bind(config: LanConfig) -> Result<Self, NetworkError> {
        config.validate()?;

        let socket = bind_socket(config.bind_socket_addr()?)?;
        let network_id = config
            .network_id
            .unwrap_or_else(|| rand::thread_rng().gen());
        let local_ip = match config.local_ip {
            Some(ip) => Some(ip),
            None => match local_ip_address::local_ip() {
                Ok(ip) => Some(ip),
                Err(e) => {
                    debug!("Local IP unknown, same-host rewrite disabled: {}", e);
                    None
                }
            },
        };

        let closed = CancellationToken::new();
        let (inbox_tx, inbox) = Inbox::new(closed.clone());
        let shared = Arc::new(Shared {
            network_id,
            socket,
            broadcast_addr: config.broadcast_socket_addr(),
            local_ip,
            address_ttl: config.address_ttl(),
            addresses: Mutex::new(HashMap::new()),
            responses: Mutex::new(HashMap::new()),
            server_data: Mutex::new(None),
            closed,
        });

        info!(
            "LAN signaling {} bound to {} (broadcast {})",
            network_id,
            shared.socket.local_addr()?,
            shared.broadcast_addr
        );

        let tasks = vec![
            tokio::spawn(shared.clone().receive_loop(inbox_tx)),
            tokio::spawn(shared.clone().broadcast_loop(config.broadcast_interval())),
        ];

        Ok(Self {
            shared,
            inbox,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        Ok(self.shared.socket.local_addr()?)
    }

    /// Publish server data. Every following `Request` is answered with it.
    pub fn set_server_data(&self, data: impl Into<Bytes>) {
        *self.shared.server_data.lock() = Some(data.into());
    }

    /// Stop answering `Request`s
    pub fn clear_server_data(&self) {
        *self.shared.server_data.lock() = None;
    }

    /// Server data of every host seen in a `Response`, by Network ID
    pub fn responses(&self) -> HashMap<NetworkId, Bytes> {
        self.shared.responses.lock().clone()
    }

    pub fn response(&self, network_id: NetworkId) -> Option<Bytes> {
        self.shared.responses.lock().get(&network_id).cloned()
    }

    /// Address a peer was last heard from
    pub fn address_of(&self, network_id: NetworkId) -> Option<SocketAddr> {
        self.shared
            .addresses
            .lock()
            .get(&network_id)
            .map(|peer| peer.addr)
    }

    /// Broadcast a `Request` now instead of waiting for the next tick
    pub async fn discover(&self) -> Result<(), NetworkError> {
        self.shared
            .send(&Packet::Request, self.shared.broadcast_addr)
            .await
    }
}

impl Shared {
    async fn send(&self, packet: &Packet, addr: SocketAddr) -> Result<(), NetworkError> {
        let plaintext = packet::marshal(packet, self.network_id);
        let datagram =
            crypto::seal(&plaintext).map_err(|e| NetworkError::Signaling(e.to_string()))?;
        self.socket.send_to(&datagram, addr).await?;
        Ok(())
    }

    /// Peers on the same host are reached through the broadcast address
    fn route(&self, addr: SocketAddr) -> SocketAddr {
        match self.local_ip {
            Some(ip) if ip == addr.ip() => self.broadcast_addr,
            _ => addr,
        }
    }

    fn remember(&self, network_id: NetworkId, addr: SocketAddr) {
        let peer = PeerAddress {
            addr,
            last_seen: Instant::now(),
        };
        self.addresses.lock().insert(network_id, peer);
    }

    /// Forget peers unheard from for longer than the TTL, with their
    /// server data
    fn evict_stale(&self, now: Instant) {
        let stale: Vec<NetworkId> = {
            let mut addresses = self.addresses.lock();
            let stale = addresses
                .iter()
                .filter(|(_, peer)| now.duration_since(peer.last_seen) > self.address_ttl)
                .map(|(id, _)| *id)
                .collect::<Vec<_>>();
            for id in &stale {
                addresses.remove(id);
            }
            stale
        };
        if stale.is_empty() {
            return;
        }

        let mut responses = self.responses.lock();
        for id in stale {
            trace!("Forgetting LAN peer {}", id);
            responses.remove(&id);
        }
    }

    async fn receive_loop(self: Arc<Self>, inbox: mpsc::UnboundedSender<Signal>) {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];

        loop {
            let received = tokio::select! {
                biased;
                _ = self.closed.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => received,
            };

            match received {
                Ok((len, addr)) => self.handle_datagram(&buf[..len], addr, &inbox).await,
                Err(e) => debug!("LAN receive error: {}", e),
            }
        }
        debug!("LAN receive loop for {} stopped", self.network_id);
    }

    async fn handle_datagram(
        &self,
        datagram: &[u8],
        addr: SocketAddr,
        inbox: &mpsc::UnboundedSender<Signal>,
    ) {
        let plaintext = match crypto::open(datagram) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                debug!("Discarding datagram from {}: {}", addr, e);
                return;
            }
        };
        let (sender, packet) = match packet::unmarshal(&plaintext) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!("Discarding packet from {}: {}", addr, e);
                return;
            }
        };
        if sender == self.network_id {
            trace!("Dropping own packet looped back from {}", addr);
            return;
        }

        match packet {
            Packet::Request => {
                let server_data = self.server_data.lock().clone();
                if let Some(data) = server_data {
                    let response = Packet::Response {
                        data: data.to_vec(),
                    };
                    if let Err(e) = self.send(&response, self.route(addr)).await {
                        warn!("Failed to answer request from {}: {}", addr, e);
                    }
                }
            }
            Packet::Response { data } => {
                trace!("Response from {} at {}", sender, addr);
                self.remember(sender, addr);
                self.responses.lock().insert(sender, Bytes::from(data));
            }
            Packet::Message { recipient, data } => {
                if recipient != self.network_id {
                    trace!("Message for {} ignored", recipient);
                    return;
                }
                self.remember(sender, addr);
                if data == PING {
                    return;
                }
                match Signal::decode(&data, sender) {
                    Ok(signal) => {
                        let _ = inbox.send(signal);
                    }
                    Err(e) => warn!("Discarding message from {}: {}", sender, e),
                }
            }
        }
    }

    async fn broadcast_loop(self: Arc<Self>, period: Duration) {
        let mut ticker = tokio::time::interval(period);

        loop {
            tokio::select! {
                biased;
                _ = self.closed.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.send(&Packet::Request, self.broadcast_addr).await {
                debug!("Failed to broadcast request: {}", e);
            }

            self.evict_stale(Instant::now());
            let peers: Vec<(NetworkId, SocketAddr)> = self
                .addresses
                .lock()
                .iter()
                .map(|(id, peer)| (*id, peer.addr))
                .collect();
            for (recipient, addr) in peers {
                let ping = Packet::Message {
                    recipient,
                    data: PING.to_string(),
                };
                if let Err(e) = self.send(&ping, self.route(addr)).await {
                    debug!("Failed to ping {}: {}", recipient, e);
                }
            }
        }
    }
}

#[async_trait]
impl Signaling for LanSignaling {
    async fn write_signal(&self, signal: &Signal) -> Result<(), NetworkError> {
        if self.shared.closed.is_cancelled() {
            return Err(NetworkError::SignalingClosed);
        }

        let text = signal.encode();
        if text.len() > MAX_MESSAGE_SIZE {
            return Err(NetworkError::Signaling(format!(
                "signal of {} bytes too large for LAN",
                text.len()
            )));
        }

        let addr = self
            .address_of(signal.network_id)
            .ok_or(NetworkError::UnknownNetwork(signal.network_id))?;
        let packet = Packet::Message {
            recipient: signal.network_id,
            data: text,
        };
        self.shared.send(&packet, self.shared.route(addr)).await
    }

    async fn read_signal(&self) -> Result<Signal, NetworkError> {
        self.inbox.recv().await
    }

    /// No TURN servers on LAN
    async fn credentials(&self) -> Result<Option<Credentials>, NetworkError> {
        if self.shared.closed.is_cancelled() {
            return Err(NetworkError::SignalingClosed);
        }
        Ok(None)
    }

    fn network_id(&self) -> NetworkId {
        self.shared.network_id
    }

    async fn close(&self) {
        self.shared.closed.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        if tasks.is_empty() {
            return;
        }
        for task in tasks {
            let _ = task.await;
        }
        info!("LAN signaling {} closed", self.shared.network_id);
    }
}

#[async_trait]
impl Publisher for LanSignaling {
    async fn publish(&self, blob: Bytes) -> Result<(), NetworkError> {
        self.set_server_data(blob);
        Ok(())
    }
}

impl Drop for LanSignaling {
    fn drop(&mut self) {
        self.shared.closed.cancel();
    }
}
