//! Dialer: offers a peer connection to a remote Network ID
//!
//! A read task started by the first dial owns the signaling channel and
//! routes signals by Connection ID. A dial reads its own route while it
//! negotiates; once the connection is open a follower task keeps draining
//! that route until the connection closes. Signals with no route are dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::conn::{Conn, ConnState, PeerState};
use super::error::NetworkError;
use super::transport::{Role, Transport, TransportStack};
use crate::config::DialConfig;
use crate::protocol::{
    ConnectionId, ErrorCode, IceCandidate, NetworkId, SessionDescription, Setup, Signal,
    SignalType,
};
use crate::signaling::Signaling;

/// Creates outgoing peer connections
///
/// Dials on one dialer run one at a time. The dialer consumes every signal
/// of its channel, so the channel should not be shared with a
/// [`Listener`](super::Listener).
pub struct Dialer {
    signaling: Arc<dyn Signaling>,
    transport: Arc<dyn Transport>,
    config: DialConfig,
    dialing: tokio::sync::Mutex<()>,
    routes: Arc<Mutex<Routes>>,
    shutdown: CancellationToken,
    read_task: Mutex<Option<JoinHandle<()>>>,
}

/// Connections signals are delivered to, by Connection ID
#[derive(Default)]
struct Routes {
    connections: HashMap<ConnectionId, Route>,
    /// Set once the read task has stopped
    ended: bool,
}

struct Route {
    remote_network_id: NetworkId,
    signals: mpsc::UnboundedSender<Signal>,
}

impl Routes {
    /// Drop the route of `connection_id` if nobody reads it anymore
    fn remove_closed(&mut self, connection_id: ConnectionId) {
        let closed = self
            .connections
            .get(&connection_id)
            .is_some_and(|route| route.signals.is_closed());
        if closed {
            self.connections.remove(&connection_id);
        }
    }
}

impl Dialer {
    pub fn new(
        signaling: Arc<dyn Signaling>,
        transport: Arc<dyn Transport>,
        config: DialConfig,
    ) -> Result<Self, NetworkError> {
        config.validate()?;
        Ok(Self {
            signaling,
            transport,
            config,
            dialing: tokio::sync::Mutex::new(()),
            routes: Arc::new(Mutex::new(Routes::default())),
            shutdown: CancellationToken::new(),
            read_task: Mutex::new(None),
        })
    }

    pub fn network_id(&self) -> NetworkId {
        self.signaling.network_id()
    }

    /// Dial `network_id` with the configured timeout
    pub async fn dial(&self, network_id: NetworkId) -> Result<Conn, NetworkError> {
        self.dial_with_timeout(network_id, self.config.timeout())
            .await
    }

    /// Dial `network_id`. At expiry the remote is sent
    /// `CONNECTERROR NegotiationTimeout` and the dial fails with `DialTimeout`.
    pub async fn dial_with_timeout(
        &self,
        network_id: NetworkId,
        timeout: Duration,
    ) -> Result<Conn, NetworkError> {
        let _dialing = self.dialing.lock().await;

        let connection_id = self
            .config
            .connection_id
            .unwrap_or_else(|| rand::thread_rng().gen());
        let peer = Arc::new(PeerState::new(
            Role::Dialer,
            connection_id,
            self.signaling.network_id(),
            network_id,
            CancellationToken::new(),
        ));
        info!("Dialing {} with connection {}", network_id, connection_id);

        let mut signals = self.register(&peer)?;
        let mut stack: Option<Arc<dyn TransportStack>> = None;
        let result = tokio::time::timeout(timeout, self.offer(&peer, &mut signals, &mut stack))
            .await
            .unwrap_or(Err(NetworkError::DialTimeout));

        match result {
            Ok(conn) => {
                if let Some(stack) = stack.take() {
                    tokio::spawn(follow(peer, stack, signals, self.routes.clone()));
                }
                Ok(conn)
            }
            Err(e) => {
                warn!("Dial {} to {} failed: {}", connection_id, network_id, e);
                drop(signals);
                self.routes.lock().remove_closed(connection_id);

                let notify = !matches!(
                    e,
                    NetworkError::Remote { .. }
                        | NetworkError::SignalingClosed
                        | NetworkError::Unauthorized
                );
                if notify {
                    let reply = Signal::error(connection_id, e.error_code(), network_id);
                    if let Err(e) = self.signaling.write_signal(&reply).await {
                        debug!("Failed to send CONNECTERROR: {}", e);
                    }
                }
                peer.fail(&e);
                if let Some(stack) = stack.take() {
                    stack.close().await;
                }
                peer.mark_released();
                Err(e)
            }
        }
    }

    /// Route signals of `peer`'s connection to the returned queue, starting
    /// the read task on first use
    fn register(
        &self,
        peer: &PeerState,
    ) -> Result<mpsc::UnboundedReceiver<Signal>, NetworkError> {
        {
            let mut read_task = self.read_task.lock();
            if read_task.is_none() {
                *read_task = Some(tokio::spawn(route_signals(
                    self.signaling.clone(),
                    self.routes.clone(),
                    self.shutdown.clone(),
                )));
            }
        }

        let mut routes = self.routes.lock();
        if routes.ended {
            return Err(NetworkError::SignalingClosed);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        routes.connections.insert(
            peer.connection_id,
            Route {
                remote_network_id: peer.remote_network_id,
                signals: tx,
            },
        );
        Ok(rx)
    }

    /// The offerer sequence
    async fn offer(
        &self,
        peer: &Arc<PeerState>,
        signals: &mut mpsc::UnboundedReceiver<Signal>,
        slot: &mut Option<Arc<dyn TransportStack>>,
    ) -> Result<Conn, NetworkError> {
        let remote = peer.remote_network_id;
        let connection_id = peer.connection_id;

        let credentials = match self.signaling.credentials().await {
            Ok(credentials) => credentials,
            Err(NetworkError::SignalingClosed) => return Err(NetworkError::SignalingClosed),
            Err(e) => {
                debug!("Credentials unavailable: {}", e);
                return Err(NetworkError::TurnAuthFailed);
            }
        };

        let stack: Arc<dyn TransportStack> = Arc::from(
            self.transport
                .gather(credentials.as_ref())
                .await
                .map_err(|e| NetworkError::GatheringFailed(e.to_string()))?,
        );
        *slot = Some(stack.clone());

        let local = stack.local_parameters();
        peer.set_local_candidates(local.candidates.clone());

        let offer = SessionDescription {
            session_id: rand::thread_rng().gen_range(1..i64::MAX as u64),
            ice_ufrag: local.ice_ufrag.clone(),
            ice_pwd: local.ice_pwd.clone(),
            fingerprint: local.fingerprint.clone(),
            setup: Setup::Active,
            max_message_size: local.max_message_size,
        };
        self.signaling
            .write_signal(&Signal::new(
                SignalType::ConnectRequest,
                connection_id,
                offer.encode(),
                remote,
            ))
            .await?;
        for (index, candidate) in local.candidates.iter().enumerate() {
            self.signaling
                .write_signal(&Signal::new(
                    SignalType::CandidateAdd,
                    connection_id,
                    candidate.encode(&local.ice_ufrag, index),
                    remote,
                ))
                .await?;
        }
        peer.advance(ConnState::Negotiating);

        // Candidates may overtake the answer on some channels
        let mut early = Vec::new();
        let answer = loop {
            match next_signal(signals).await? {
                Incoming::Answer(answer) => break answer,
                Incoming::Candidate(candidate) => early.push(candidate),
            }
        };
        debug!("Connection {} answered by {}", connection_id, remote);

        for candidate in early {
            add_candidate(peer, stack.as_ref(), candidate).await?;
        }
        peer.advance(ConnState::Connecting);

        let channels = {
            let start = stack.start(Role::Dialer, &answer);
            tokio::pin!(start);
            loop {
                tokio::select! {
                    started = &mut start => {
                        break started
                            .map_err(|e| NetworkError::TransportStartFailed(e.to_string()))?;
                    }
                    incoming = next_signal(signals) => match incoming? {
                        Incoming::Candidate(candidate) => {
                            add_candidate(peer, stack.as_ref(), candidate).await?;
                        }
                        Incoming::Answer(_) => {
                            warn!(
                                "Ignoring repeated CONNECTRESPONSE for connection {}",
                                connection_id
                            );
                        }
                    },
                }
            }
        };

        Ok(Conn::spawn(
            peer.clone(),
            stack,
            channels,
            answer.max_message_size,
        ))
    }
}

impl Drop for Dialer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Read task: deliver each signal to the connection it belongs to
async fn route_signals(
    signaling: Arc<dyn Signaling>,
    routes: Arc<Mutex<Routes>>,
    shutdown: CancellationToken,
) {
    loop {
        let signal = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            signal = signaling.read_signal() => signal,
        };
        match signal {
            Ok(signal) => deliver(&routes, signal),
            Err(e) => {
                debug!("Dialer signaling ended: {}", e);
                break;
            }
        }
    }

    // Pending reads see the route close and fail with SignalingClosed
    let mut routes = routes.lock();
    routes.ended = true;
    routes.connections.clear();
}

fn deliver(routes: &Mutex<Routes>, signal: Signal) {
    if signal.typ == SignalType::ConnectRequest {
        warn!("Dialer ignoring CONNECTREQUEST from {}", signal.network_id);
        return;
    }

    let mut routes = routes.lock();
    let connection_id = signal.connection_id;
    let Some(route) = routes.connections.get(&connection_id) else {
        debug!(
            "Dialer dropping {} for unknown connection {} from {}",
            signal.typ, connection_id, signal.network_id
        );
        return;
    };
    if route.remote_network_id != signal.network_id {
        debug!(
            "Dialer dropping {} for connection {} from unexpected network {}",
            signal.typ, connection_id, signal.network_id
        );
        return;
    }
    if route.signals.send(signal).is_err() {
        routes.connections.remove(&connection_id);
    }
}

/// Next signal of a negotiation. Cancel-safe.
async fn next_signal(
    signals: &mut mpsc::UnboundedReceiver<Signal>,
) -> Result<Incoming, NetworkError> {
    loop {
        let signal = signals.recv().await.ok_or(NetworkError::SignalingClosed)?;
        match signal.typ {
            SignalType::ConnectResponse => {
                return SessionDescription::parse(&signal.data).map(Incoming::Answer);
            }
            SignalType::CandidateAdd => match IceCandidate::parse(&signal.data) {
                Ok(candidate) => return Ok(Incoming::Candidate(candidate)),
                Err(e) => warn!("Ignoring bad candidate: {}", e),
            },
            SignalType::ConnectError => {
                let code = signal
                    .error_code()
                    .unwrap_or(ErrorCode::SignalingUnknownError);
                return Err(NetworkError::Remote { code });
            }
            SignalType::ConnectRequest => {}
        }
    }
}

/// Per-connection task after open: apply trickled candidates and close on
/// `CONNECTERROR` until the connection closes
async fn follow(
    peer: Arc<PeerState>,
    stack: Arc<dyn TransportStack>,
    mut signals: mpsc::UnboundedReceiver<Signal>,
    routes: Arc<Mutex<Routes>>,
) {
    let connection_id = peer.connection_id;
    loop {
        let incoming = tokio::select! {
            biased;
            _ = peer.closed.cancelled() => break,
            incoming = next_signal(&mut signals) => incoming,
        };
        match incoming {
            Ok(Incoming::Candidate(candidate)) => {
                if let Err(e) = stack.add_remote_candidate(&candidate).await {
                    debug!("Connection {}: late candidate rejected: {}", connection_id, e);
                }
                peer.push_remote_candidate(candidate);
            }
            Ok(Incoming::Answer(_)) => {
                debug!("Ignoring CONNECTRESPONSE for open connection {}", connection_id);
            }
            Err(NetworkError::Remote { code }) => {
                info!("Connection {} closed by remote: {}", connection_id, code);
                peer.fail(&NetworkError::Remote { code });
                break;
            }
            Err(NetworkError::SignalingClosed) => break,
            Err(e) => debug!("Connection {}: ignoring signal: {}", connection_id, e),
        }
    }

    drop(signals);
    routes.lock().remove_closed(connection_id);
}

enum Incoming {
    Answer(SessionDescription),
    Candidate(IceCandidate),
}

async fn add_candidate(
    peer: &PeerState,
    stack: &dyn TransportStack,
    candidate: IceCandidate,
) -> Result<(), NetworkError> {
    stack
        .add_remote_candidate(&candidate)
        .await
        .map_err(|e| NetworkError::TransportStartFailed(e.to_string()))?;
    peer.push_remote_candidate(candidate);
    Ok(())
}
