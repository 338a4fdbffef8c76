//! E2E tests for listener and dialer negotiation
//!
//! Runs the full offer/answer flow over an in-memory signaling hub and the
//! loopback transport, covering the data path and the failure cases.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use nethernet::config::{DialConfig, ListenConfig};
use nethernet::network::{
    ConnState, Dialer, Listener, LoopbackTransport, NetworkError, Role, Transport,
    TransportStack,
};
use nethernet::protocol::{
    ErrorCode, Fingerprint, SessionDescription, Setup, Signal, SignalType,
};
use nethernet::signaling::{MemoryNetwork, MemorySignaling, Signaling};

const HOST: u64 = 200;
const CLIENT: u64 = 100;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Listener on `HOST` and dialer on `CLIENT`, sharing one loopback network
fn setup(network: &MemoryNetwork, transport: &LoopbackTransport) -> (Listener, Dialer) {
    let host: Arc<dyn Signaling> = Arc::new(network.join(HOST).unwrap());
    let client: Arc<dyn Signaling> = Arc::new(network.join(CLIENT).unwrap());

    let listener =
        Listener::bind(host, Arc::new(transport.clone()), ListenConfig::default()).unwrap();
    let dialer = Dialer::new(client, Arc::new(transport.clone()), DialConfig::default()).unwrap();
    (listener, dialer)
}

fn offer_without_ufrag() -> String {
    let offer = SessionDescription {
        session_id: 1,
        ice_ufrag: "REMOVED".to_string(),
        ice_pwd: "abcdefghijklmnopqrstuvwx".to_string(),
        fingerprint: Fingerprint {
            algorithm: "sha-256".to_string(),
            value: "AB:CD".to_string(),
        },
        setup: Setup::Active,
        max_message_size: 262_144,
    };
    offer
        .encode()
        .split("\r\n")
        .filter(|line| !line.starts_with("a=ice-ufrag"))
        .collect::<Vec<_>>()
        .join("\r\n")
}

async fn next_signal(node: &MemorySignaling) -> Signal {
    tokio::time::timeout(Duration::from_secs(5), node.read_signal())
        .await
        .expect("signal within timeout")
        .unwrap()
}

/// Test: Loopback dial and answer
/// Given a listener on network ID 200
/// When network ID 100 dials it
/// Then both sides hold an open connection addressed to the other
#[tokio::test]
async fn test_dial_and_accept() {
    init_tracing();
    let network = MemoryNetwork::new();
    let transport = LoopbackTransport::new();
    let (listener, dialer) = setup(&network, &transport);

    let (dialed, accepted) = tokio::join!(dialer.dial(HOST), listener.accept());
    let dialed = dialed.unwrap();
    let accepted = accepted.unwrap();

    assert_eq!(accepted.remote_network_id(), CLIENT);
    assert_eq!(dialed.remote_network_id(), HOST);
    assert_eq!(accepted.state(), ConnState::Open);
    assert_eq!(dialed.state(), ConnState::Open);
    assert_eq!(accepted.connection_id(), dialed.connection_id());
    assert_eq!(listener.network_id(), HOST);

    // Both addresses carry the candidates that were exchanged
    assert_eq!(dialed.local_addr().network_id, CLIENT);
    assert_eq!(dialed.remote_addr().network_id, HOST);
    assert!(!accepted.remote_addr().candidates.is_empty());
    assert!(!dialed.local_addr().candidates.is_empty());

    dialed.write_message(b"hello host").await.unwrap();
    assert_eq!(&accepted.read_message().await.unwrap()[..], b"hello host");

    accepted.write_message(b"hello client").await.unwrap();
    assert_eq!(&dialed.read_message().await.unwrap()[..], b"hello client");

    listener.close().await;
}

/// Test: Offer missing ice-ufrag
/// Given a listener
/// When a CONNECTREQUEST arrives whose SDP has no ice-ufrag
/// Then CONNECTERROR 13 is sent back and nothing is accepted
#[tokio::test]
async fn test_offer_without_ice_ufrag_rejected() {
    init_tracing();
    let network = MemoryNetwork::new();
    let transport = LoopbackTransport::new();
    let host: Arc<dyn Signaling> = Arc::new(network.join(HOST).unwrap());
    let listener = Listener::bind(host, Arc::new(transport.clone()), ListenConfig::default())
        .unwrap();
    let client = network.join(CLIENT).unwrap();

    client
        .write_signal(&Signal::new(
            SignalType::ConnectRequest,
            77,
            offer_without_ufrag(),
            HOST,
        ))
        .await
        .unwrap();

    let reply = next_signal(&client).await;
    assert_eq!(reply.typ, SignalType::ConnectError);
    assert_eq!(reply.connection_id, 77);
    assert_eq!(reply.data, "13");
    assert_eq!(
        reply.error_code(),
        Some(ErrorCode::FailedToSetRemoteDescription)
    );

    // No negotiation was started for the rejected offer
    assert_eq!(transport.open_stacks(), 0);
    let accepted = tokio::time::timeout(Duration::from_millis(200), listener.accept()).await;
    assert!(accepted.is_err(), "Nothing should be accepted");

    listener.close().await;
}

/// Test: Large payload fragmentation
/// Given an open connection
/// When a 25 001-byte payload is written
/// Then the remote reads the same 25 001 bytes
#[tokio::test]
async fn test_large_payload_round_trip() {
    init_tracing();
    let network = MemoryNetwork::new();
    let transport = LoopbackTransport::new();
    let (listener, dialer) = setup(&network, &transport);

    let (dialed, accepted) = tokio::join!(dialer.dial(HOST), listener.accept());
    let (dialed, accepted) = (dialed.unwrap(), accepted.unwrap());

    let payload: Vec<u8> = (0..25_001).map(|i| (i % 256) as u8).collect();
    assert_eq!(dialed.write_message(&payload).await.unwrap(), 25_001);

    let message = accepted.read_message().await.unwrap();
    assert_eq!(message.len(), 25_001);
    assert_eq!(&message[..], &payload[..]);

    listener.close().await;
}

/// Test: Message ordering
/// Given an open connection
/// When many messages of random sizes are written in sequence
/// Then they are read in the same order
#[tokio::test]
async fn test_messages_arrive_in_order() {
    init_tracing();
    let network = MemoryNetwork::new();
    let transport = LoopbackTransport::new();
    let (listener, dialer) = setup(&network, &transport);

    let (dialed, accepted) = tokio::join!(dialer.dial(HOST), listener.accept());
    let (dialed, accepted) = (dialed.unwrap(), accepted.unwrap());

    let mut rng = rand::thread_rng();
    let messages: Vec<Vec<u8>> = (0..200u32)
        .map(|i| {
            let len = rng.gen_range(4..30_000);
            let mut message = vec![rng.gen::<u8>(); len];
            message[..4].copy_from_slice(&i.to_le_bytes());
            message
        })
        .collect();

    for message in &messages {
        dialed.write_message(message).await.unwrap();
    }
    for message in &messages {
        assert_eq!(&accepted.read_message().await.unwrap()[..], &message[..]);
    }

    listener.close().await;
}

/// Test: Dial timeout
/// Given a remote node that never answers
/// When dialing it with a short deadline
/// Then the dial fails with DialTimeout, CONNECTERROR 2 is sent and the
/// local transports are closed
#[tokio::test]
async fn test_dial_timeout() {
    init_tracing();
    let network = MemoryNetwork::new();
    let transport = LoopbackTransport::new();
    let silent = network.join(HOST).unwrap();
    let client: Arc<dyn Signaling> = Arc::new(network.join(CLIENT).unwrap());
    let dialer = Dialer::new(client, Arc::new(transport.clone()), DialConfig::default()).unwrap();

    let result = dialer
        .dial_with_timeout(HOST, Duration::from_millis(300))
        .await;
    assert!(matches!(result, Err(NetworkError::DialTimeout)));
    assert_eq!(transport.open_stacks(), 0);

    let request = next_signal(&silent).await;
    assert_eq!(request.typ, SignalType::ConnectRequest);
    assert_eq!(request.network_id, CLIENT);

    let mut signal = next_signal(&silent).await;
    while signal.typ == SignalType::CandidateAdd {
        signal = next_signal(&silent).await;
    }
    assert_eq!(signal.typ, SignalType::ConnectError);
    assert_eq!(signal.connection_id, request.connection_id);
    assert_eq!(signal.error_code(), Some(ErrorCode::NegotiationTimeout));
}

/// Test: Remote rejection
/// Given a remote node that answers an offer with CONNECTERROR
/// When dialing it
/// Then the dial fails carrying the remote error code
#[tokio::test]
async fn test_dial_rejected_by_remote() {
    init_tracing();
    let network = MemoryNetwork::new();
    let transport = LoopbackTransport::new();
    let host = network.join(HOST).unwrap();
    let client: Arc<dyn Signaling> = Arc::new(network.join(CLIENT).unwrap());
    let dialer = Dialer::new(client, Arc::new(transport.clone()), DialConfig::default()).unwrap();

    let rejecter = tokio::spawn(async move {
        let request = next_signal(&host).await;
        host.write_signal(&Signal::error(
            request.connection_id,
            ErrorCode::FailedToCreatePeerConnection,
            request.network_id,
        ))
        .await
        .unwrap();
        host
    });

    let result = dialer.dial(HOST).await;
    assert!(matches!(
        result,
        Err(NetworkError::Remote {
            code: ErrorCode::FailedToCreatePeerConnection
        })
    ));
    assert_eq!(transport.open_stacks(), 0);
    rejecter.await.unwrap();
}

/// Test: Listener isolation
/// Given a listener with no negotiations
/// When a CANDIDATEADD for an unknown connection arrives
/// Then nothing is accepted and later dials still succeed
#[tokio::test]
async fn test_unknown_candidate_ignored() {
    init_tracing();
    let network = MemoryNetwork::new();
    let transport = LoopbackTransport::new();
    let (listener, dialer) = setup(&network, &transport);
    let stranger = network.join(300).unwrap();

    stranger
        .write_signal(&Signal::new(
            SignalType::CandidateAdd,
            999,
            "candidate:1 1 udp 2130706431 10.0.0.5 5000 typ host generation 0 ufrag x network-id 0 network-cost 0",
            HOST,
        ))
        .await
        .unwrap();

    let accepted = tokio::time::timeout(Duration::from_millis(200), listener.accept()).await;
    assert!(accepted.is_err(), "Nothing should be accepted");
    assert_eq!(transport.open_stacks(), 0);

    let (dialed, accepted) = tokio::join!(dialer.dial(HOST), listener.accept());
    let accepted = accepted.unwrap();
    assert_eq!(accepted.connection_id(), dialed.unwrap().connection_id());
    assert_ne!(accepted.connection_id(), 999);

    listener.close().await;
}

/// Test: Close idempotence
/// Given an accepted connection
/// When the connection and then the listener are closed twice
/// Then every call succeeds, accept fails and the dialed side closes too
#[tokio::test]
async fn test_close_idempotence() {
    init_tracing();
    let network = MemoryNetwork::new();
    let transport = LoopbackTransport::new();
    let (listener, dialer) = setup(&network, &transport);

    let (dialed, accepted) = tokio::join!(dialer.dial(HOST), listener.accept());
    let (dialed, accepted) = (dialed.unwrap(), accepted.unwrap());

    accepted.close().await;
    accepted.close().await;
    assert_eq!(accepted.state(), ConnState::Closed);
    assert!(matches!(
        accepted.write_message(b"x").await,
        Err(NetworkError::ConnectionClosed)
    ));

    tokio::time::timeout(Duration::from_secs(2), dialed.closed())
        .await
        .expect("dialed side closes");
    assert!(matches!(
        dialed.read_message().await,
        Err(NetworkError::ConnectionClosed)
    ));

    listener.close().await;
    listener.close().await;
    assert!(matches!(
        listener.accept().await,
        Err(NetworkError::ListenerClosed)
    ));

    dialed.close().await;
    assert_eq!(transport.open_stacks(), 0);
}

/// Test: Listener close cascades
/// Given an accepted connection
/// When the listener is closed
/// Then the accepted connection and its remote end are closed
#[tokio::test]
async fn test_listener_close_closes_connections() {
    init_tracing();
    let network = MemoryNetwork::new();
    let transport = LoopbackTransport::new();
    let (listener, dialer) = setup(&network, &transport);

    let (dialed, accepted) = tokio::join!(dialer.dial(HOST), listener.accept());
    let (dialed, accepted) = (dialed.unwrap(), accepted.unwrap());

    listener.close().await;

    tokio::time::timeout(Duration::from_secs(2), accepted.closed())
        .await
        .expect("accepted side closes");
    tokio::time::timeout(Duration::from_secs(2), dialed.closed())
        .await
        .expect("dialed side closes");
    assert_eq!(accepted.state(), ConnState::Closed);
    assert_eq!(dialed.state(), ConnState::Closed);
}

/// Test: Sequential dials
/// Given one listener
/// When the same dialer connects twice
/// Then two distinct connections are accepted
#[tokio::test]
async fn test_sequential_dials() {
    init_tracing();
    let network = MemoryNetwork::new();
    let transport = LoopbackTransport::new();
    let (listener, dialer) = setup(&network, &transport);

    let (first, accepted_first) = tokio::join!(dialer.dial(HOST), listener.accept());
    let (second, accepted_second) = tokio::join!(dialer.dial(HOST), listener.accept());

    let (first, second) = (first.unwrap(), second.unwrap());
    let (accepted_first, accepted_second) = (accepted_first.unwrap(), accepted_second.unwrap());
    assert_ne!(first.connection_id(), second.connection_id());

    second.write_message(b"second").await.unwrap();
    first.write_message(b"first").await.unwrap();
    assert_eq!(&accepted_first.read_message().await.unwrap()[..], b"first");
    assert_eq!(&accepted_second.read_message().await.unwrap()[..], b"second");

    listener.close().await;
}

/// Test: Signals after open
/// Given a connection dialed to a scripted answerer
/// When the answerer trickles a candidate, then a stray signal for another
/// connection, then CONNECTERROR after the connection opened
/// Then the candidate is recorded, the stray signal is dropped and the
/// dialed connection closes with the remote error
#[tokio::test]
async fn test_dialed_connection_follows_late_signals() {
    init_tracing();
    let network = MemoryNetwork::new();
    let transport = LoopbackTransport::new();
    let host = network.join(HOST).unwrap();
    let client: Arc<dyn Signaling> = Arc::new(network.join(CLIENT).unwrap());
    let dialer = Dialer::new(client, Arc::new(transport.clone()), DialConfig::default()).unwrap();

    let answerer = {
        let transport = transport.clone();
        tokio::spawn(async move {
            let request = next_signal(&host).await;
            assert_eq!(request.typ, SignalType::ConnectRequest);
            let offer = SessionDescription::parse(&request.data).unwrap();

            let stack: Box<dyn TransportStack> = transport.gather(None).await.unwrap();
            let local = stack.local_parameters().clone();
            let answer = SessionDescription {
                session_id: 2,
                ice_ufrag: local.ice_ufrag.clone(),
                ice_pwd: local.ice_pwd.clone(),
                fingerprint: local.fingerprint.clone(),
                setup: Setup::ActPass,
                max_message_size: local.max_message_size,
            };
            host.write_signal(&Signal::new(
                SignalType::ConnectResponse,
                request.connection_id,
                answer.encode(),
                CLIENT,
            ))
            .await
            .unwrap();
            let channels = stack.start(Role::Listener, &offer).await.unwrap();
            (host, request.connection_id, stack, channels)
        })
    };

    let dialed = dialer.dial(HOST).await.unwrap();
    let (host, connection_id, _stack, _channels) = answerer.await.unwrap();
    assert_eq!(dialed.state(), ConnState::Open);
    assert!(dialed.remote_addr().candidates.is_empty());

    host.write_signal(&Signal::new(
        SignalType::CandidateAdd,
        connection_id,
        "candidate:1 1 udp 2130706431 10.0.0.5 5000 typ host generation 0 ufrag x network-id 0 network-cost 0",
        CLIENT,
    ))
    .await
    .unwrap();
    tokio::time::timeout(Duration::from_secs(2), async {
        while dialed.remote_addr().candidates.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("late candidate recorded");
    assert_eq!(dialed.remote_addr().candidates[0].address, "10.0.0.5");

    host.write_signal(&Signal::error(
        connection_id.wrapping_add(1),
        ErrorCode::NegotiationTimeout,
        CLIENT,
    ))
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(dialed.state(), ConnState::Open);

    host.write_signal(&Signal::error(
        connection_id,
        ErrorCode::NegotiationTimeout,
        CLIENT,
    ))
    .await
    .unwrap();
    tokio::time::timeout(Duration::from_secs(2), dialed.closed())
        .await
        .expect("remote error closes the connection");
    assert_eq!(dialed.state(), ConnState::Closed);
}
