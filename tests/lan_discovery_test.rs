//! E2E tests for LAN discovery signaling
//!
//! Nodes bind to 127.0.0.1 on ephemeral ports and point their broadcast
//! address at each other, so discovery runs without a real broadcast domain.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;

use nethernet::config::{DialConfig, LanConfig, ListenConfig};
use nethernet::network::{
    Announcer, ConnState, Dialer, Listener, LoopbackTransport, RoomStatus, RuntimeStatus,
};
use nethernet::protocol::{SessionInfo, SignalType};
use nethernet::signaling::lan::{crypto, packet};
use nethernet::signaling::{LanSignaling, Signaling};

const HOST: u64 = 0x0A0B_0C0D;
const CLIENT: u64 = 0x1111;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Address no test peer sends from
const OTHER_HOST: [u8; 4] = [192, 0, 2, 1];

/// Loopback node that broadcasts to `broadcast_addr`. Peers are treated as
/// remote hosts unless `local_ip` is overridden.
fn config(network_id: u64, broadcast_addr: SocketAddr, interval_ms: u64) -> LanConfig {
    LanConfig {
        bind_addr: "127.0.0.1".to_string(),
        port: 0,
        broadcast_addr: Some(broadcast_addr),
        broadcast_interval_ms: interval_ms,
        network_id: Some(network_id),
        local_ip: Some(IpAddr::from(OTHER_HOST)),
        ..Default::default()
    }
}

/// Node that considers every 127.0.0.1 peer to be on its own host
fn same_host_config(network_id: u64, broadcast_addr: SocketAddr, interval_ms: u64) -> LanConfig {
    LanConfig {
        local_ip: Some("127.0.0.1".parse().unwrap()),
        ..config(network_id, broadcast_addr, interval_ms)
    }
}

/// A host and a client whose requests reach the host
async fn host_and_client() -> (LanSignaling, LanSignaling) {
    // The host only answers; its own broadcasts go to the discard port
    let host = LanSignaling::bind(config(HOST, "127.0.0.1:9".parse().unwrap(), 60_000))
        .await
        .unwrap();
    let client = LanSignaling::bind(config(CLIENT, host.local_addr().unwrap(), 100))
        .await
        .unwrap();
    (host, client)
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition within timeout");
}

/// Encrypt a plaintext packet the way a peer on the subnet would
async fn send_raw(to: SocketAddr, sender: u64, packet: &packet::Packet) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let datagram = crypto::seal(&packet::marshal(packet, sender)).unwrap();
    socket.send_to(&datagram, to).await.unwrap();
}

/// Test: Server data discovery
/// Given a host publishing server data
/// When a client broadcasts requests
/// Then the client caches the host's data under its network ID
#[tokio::test]
async fn test_client_discovers_server_data() {
    init_tracing();
    let (host, client) = host_and_client().await;

    host.set_server_data(&b"{\"worldName\":\"Test World\"}"[..]);

    wait_for(|| client.response(HOST).is_some()).await;
    assert_eq!(
        &client.response(HOST).unwrap()[..],
        b"{\"worldName\":\"Test World\"}"
    );
    assert_eq!(client.address_of(HOST), Some(host.local_addr().unwrap()));
    assert_eq!(client.responses().len(), 1);

    client.close().await;
    host.close().await;
}

/// Test: Silent host
/// Given a host without server data
/// When a client requests
/// Then no response is cached
#[tokio::test]
async fn test_host_without_data_stays_silent() {
    init_tracing();
    let (host, client) = host_and_client().await;

    client.discover().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(client.response(HOST).is_none());

    host.set_server_data(&b"now"[..]);
    wait_for(|| client.response(HOST).is_some()).await;

    host.clear_server_data();
    client.close().await;
    host.close().await;
}

/// Test: Announced session document
/// Given a host announcing its room through the announcer
/// When a client discovers it
/// Then the cached data decodes to the announced session
#[tokio::test]
async fn test_announced_session_discovered() {
    init_tracing();
    let (host, client) = host_and_client().await;
    let host_addr = host.local_addr().unwrap();

    let room = RoomStatus {
        world_name: "LAN World".to_string(),
        host_name: "Host".to_string(),
        ..Default::default()
    };
    let announcer = Announcer::new(host, room);
    let runtime = RuntimeStatus {
        member_count: 1,
        network_id: HOST,
        raknet_guid: None,
    };
    assert!(announcer.announce(&runtime).await.unwrap());
    assert!(!announcer.announce(&runtime).await.unwrap());

    wait_for(|| client.response(HOST).is_some()).await;
    let blob = client.response(HOST).unwrap();
    let session = SessionInfo::from_bytes(&blob).unwrap();
    assert_eq!(session.world_name, "LAN World");
    assert_eq!(session.member_count, 1);
    assert_eq!(client.address_of(HOST), Some(host_addr));

    client.close().await;
    announcer.publisher().close().await;
}

/// Test: Signals after discovery
/// Given a client that discovered a host
/// When signals are written in both directions
/// Then each side reads the other's signal with the sender's network ID
#[tokio::test]
async fn test_signals_exchanged_after_discovery() {
    init_tracing();
    let (host, client) = host_and_client().await;
    host.set_server_data(&b"data"[..]);
    wait_for(|| client.address_of(HOST).is_some()).await;

    let request = nethernet::Signal::new(SignalType::ConnectRequest, 9, "v=0\r\na=x", HOST);
    client.write_signal(&request).await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), host.read_signal())
        .await
        .expect("signal within timeout")
        .unwrap();
    assert_eq!(received.typ, SignalType::ConnectRequest);
    assert_eq!(received.connection_id, 9);
    assert_eq!(received.network_id, CLIENT);
    assert_eq!(received.data, "v=0\r\na=x");

    // The host learned the client's address from the message
    let reply = nethernet::Signal::new(SignalType::ConnectError, 9, "2", CLIENT);
    host.write_signal(&reply).await.unwrap();
    let received = tokio::time::timeout(Duration::from_secs(5), client.read_signal())
        .await
        .expect("reply within timeout")
        .unwrap();
    assert_eq!(received.network_id, HOST);
    assert_eq!(received.data, "2");

    client.close().await;
    host.close().await;
}

/// Test: Datagram filtering
/// Given a bound node
/// When it receives its own packets, pings, tampered datagrams and packets
/// for another recipient
/// Then only the valid signal addressed to it is delivered
#[tokio::test]
async fn test_datagram_filtering() {
    init_tracing();
    let node = LanSignaling::bind(config(HOST, "127.0.0.1:9".parse().unwrap(), 60_000))
        .await
        .unwrap();
    let addr = node.local_addr().unwrap();

    let message = |recipient: u64, data: &str| packet::Packet::Message {
        recipient,
        data: data.to_string(),
    };

    // Looped back from itself
    send_raw(addr, HOST, &message(HOST, "CONNECTERROR 1 2")).await;
    // Keep-alive only
    send_raw(addr, 56, &message(HOST, "Ping")).await;
    // For someone else
    send_raw(addr, 57, &message(999, "CONNECTERROR 3 2")).await;

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut tampered =
        crypto::seal(&packet::marshal(&message(HOST, "CONNECTERROR 4 2"), 58)).unwrap();
    tampered[5] ^= 0x01;
    socket.send_to(&tampered, addr).await.unwrap();

    send_raw(addr, 55, &message(HOST, "CONNECTERROR 5 2")).await;

    let received = tokio::time::timeout(Duration::from_secs(5), node.read_signal())
        .await
        .expect("signal within timeout")
        .unwrap();
    assert_eq!(received.network_id, 55);
    assert_eq!(received.connection_id, 5);

    // Pings still teach the sender's address
    wait_for(|| node.address_of(56).is_some()).await;
    assert!(node.address_of(57).is_none());
    assert!(node.address_of(58).is_none());
    assert!(node.address_of(HOST).is_none());

    node.close().await;
}

/// Test: Oversized signal
/// Given a known peer
/// When a signal larger than a LAN message is written
/// Then the write fails without sending
#[tokio::test]
async fn test_oversized_signal_rejected() {
    init_tracing();
    let (host, client) = host_and_client().await;
    host.set_server_data(&b"data"[..]);
    wait_for(|| client.address_of(HOST).is_some()).await;

    let huge = "a".repeat(packet::MAX_MESSAGE_SIZE + 1);
    let signal = nethernet::Signal::new(SignalType::CandidateAdd, 1, huge, HOST);
    assert!(client.write_signal(&signal).await.is_err());

    client.close().await;
    host.close().await;
}

/// Decrypt a captured datagram
fn decode(datagram: &[u8]) -> (u64, packet::Packet) {
    packet::unmarshal(&crypto::open(datagram).unwrap()).unwrap()
}

/// Test: Response to a peer on the same host
/// Given a host whose own IP is 127.0.0.1
/// When a client on 127.0.0.1 sends a request
/// Then the response goes to the broadcast address instead of the client
#[tokio::test]
async fn test_response_to_same_host_goes_to_broadcast() {
    init_tracing();
    let broadcast = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let host = LanSignaling::bind(same_host_config(
        HOST,
        broadcast.local_addr().unwrap(),
        60_000,
    ))
    .await
    .unwrap();
    host.set_server_data(&b"same host"[..]);

    // The first tick of the broadcast loop sends a request; skip it
    let mut buf = vec![0u8; 2048];
    let (len, _) = tokio::time::timeout(Duration::from_secs(5), broadcast.recv_from(&mut buf))
        .await
        .expect("initial request")
        .unwrap();
    assert_eq!(decode(&buf[..len]).1, packet::Packet::Request);

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let request = crypto::seal(&packet::marshal(&packet::Packet::Request, CLIENT)).unwrap();
    client
        .send_to(&request, host.local_addr().unwrap())
        .await
        .unwrap();

    let (len, from) = tokio::time::timeout(Duration::from_secs(5), broadcast.recv_from(&mut buf))
        .await
        .expect("response on the broadcast address")
        .unwrap();
    assert_eq!(from, host.local_addr().unwrap());
    let (sender, response) = decode(&buf[..len]);
    assert_eq!(sender, HOST);
    assert_eq!(
        response,
        packet::Packet::Response {
            data: b"same host".to_vec()
        }
    );

    let unicast =
        tokio::time::timeout(Duration::from_millis(300), client.recv_from(&mut buf)).await;
    assert!(unicast.is_err(), "response sent to the client directly");

    host.close().await;
}

/// Datagrams seen by [`Bridge`]
#[derive(Default)]
struct BridgeCounters {
    /// Signals the host sent to its broadcast address
    broadcast_signals: AtomicUsize,
    /// Datagrams the host sent straight to the client's learned address
    unicast_from_host: AtomicUsize,
}

/// Stands in for a shared broadcast domain between two nodes on one host.
/// The host's broadcast address is `broadcast`; everything else the client
/// exchanges with the host passes through `bridge`, which is the only
/// address each side learns for the other.
struct Bridge {
    broadcast: Arc<UdpSocket>,
    bridge: Arc<UdpSocket>,
    counters: Arc<BridgeCounters>,
}

impl Bridge {
    async fn bind() -> Self {
        Self {
            broadcast: Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap()),
            bridge: Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap()),
            counters: Arc::new(BridgeCounters::default()),
        }
    }

    fn broadcast_addr(&self) -> SocketAddr {
        self.broadcast.local_addr().unwrap()
    }

    fn bridge_addr(&self) -> SocketAddr {
        self.bridge.local_addr().unwrap()
    }

    fn start(&self, host: SocketAddr, client: SocketAddr) {
        let (broadcast, bridge, counters) = (
            self.broadcast.clone(),
            self.bridge.clone(),
            self.counters.clone(),
        );
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65_536];
            while let Ok((len, _)) = broadcast.recv_from(&mut buf).await {
                if let (_, packet::Packet::Message { data, .. }) = decode(&buf[..len]) {
                    if data != "Ping" {
                        counters.broadcast_signals.fetch_add(1, Ordering::SeqCst);
                    }
                }
                let _ = bridge.send_to(&buf[..len], client).await;
            }
        });

        let (bridge, counters) = (self.bridge.clone(), self.counters.clone());
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65_536];
            while let Ok((len, from)) = bridge.recv_from(&mut buf).await {
                if from == client {
                    let _ = bridge.send_to(&buf[..len], host).await;
                } else {
                    counters.unicast_from_host.fetch_add(1, Ordering::SeqCst);
                }
            }
        });
    }
}

/// Test: Negotiation over LAN signaling on one host
/// Given a listener and a dialer on two LAN nodes of the same host
/// When the dialer discovers the listener and connects
/// Then offer, answer and candidates cross the LAN channel, both sides open,
/// and every reply from the host travels through the broadcast address
#[tokio::test]
async fn test_dial_over_lan_on_same_host() {
    init_tracing();
    let bridge = Bridge::bind().await;

    let host = Arc::new(
        LanSignaling::bind(same_host_config(HOST, bridge.broadcast_addr(), 100))
            .await
            .unwrap(),
    );
    let client = Arc::new(
        LanSignaling::bind(config(CLIENT, bridge.bridge_addr(), 100))
            .await
            .unwrap(),
    );
    bridge.start(host.local_addr().unwrap(), client.local_addr().unwrap());

    host.set_server_data(&b"{\"worldName\":\"Same Host\"}"[..]);
    wait_for(|| client.response(HOST).is_some()).await;
    assert_eq!(client.address_of(HOST), Some(bridge.bridge_addr()));

    let transport = LoopbackTransport::new();
    let listener = Listener::bind(
        host.clone() as Arc<dyn Signaling>,
        Arc::new(transport.clone()),
        ListenConfig::default(),
    )
    .unwrap();
    let dialer = Dialer::new(
        client.clone() as Arc<dyn Signaling>,
        Arc::new(transport.clone()),
        DialConfig::default(),
    )
    .unwrap();

    let (dialed, accepted) = tokio::time::timeout(Duration::from_secs(10), async {
        tokio::join!(dialer.dial(HOST), listener.accept())
    })
    .await
    .expect("negotiation within timeout");
    let (dialed, accepted) = (dialed.unwrap(), accepted.unwrap());
    assert_eq!(dialed.state(), ConnState::Open);
    assert_eq!(accepted.state(), ConnState::Open);
    assert_eq!(accepted.remote_network_id(), CLIENT);
    assert_eq!(host.address_of(CLIENT), Some(bridge.bridge_addr()));

    dialed.write_message(b"over the LAN").await.unwrap();
    assert_eq!(&accepted.read_message().await.unwrap()[..], b"over the LAN");
    accepted.write_message(b"reply").await.unwrap();
    assert_eq!(&dialed.read_message().await.unwrap()[..], b"reply");

    // The answer and the host's candidates went out as broadcasts
    assert!(bridge.counters.broadcast_signals.load(Ordering::SeqCst) >= 2);
    assert_eq!(bridge.counters.unicast_from_host.load(Ordering::SeqCst), 0);

    dialed.close().await;
    listener.close().await;
    client.close().await;
    host.close().await;
}

/// Test: Address expiry
/// Given a node with a short address TTL
/// When a peer pings once and falls silent
/// Then its address is forgotten after the TTL
#[tokio::test]
async fn test_silent_peer_address_expires() {
    init_tracing();
    let node = LanSignaling::bind(LanConfig {
        address_ttl_ms: 200,
        ..config(HOST, "127.0.0.1:9".parse().unwrap(), 50)
    })
    .await
    .unwrap();
    let addr = node.local_addr().unwrap();

    let ping = packet::Packet::Message {
        recipient: HOST,
        data: "Ping".to_string(),
    };
    send_raw(addr, 56, &ping).await;
    wait_for(|| node.address_of(56).is_some()).await;

    wait_for(|| node.address_of(56).is_none()).await;
    let signal = nethernet::Signal::new(SignalType::CandidateAdd, 1, "x", 56);
    assert!(node.write_signal(&signal).await.is_err());

    node.close().await;
}
