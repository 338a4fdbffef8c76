//! Listener: answers incoming offers and hands out open connections
//!
//! One read task owns the signaling channel and the map of negotiations by
//! Connection ID. Each `CONNECTREQUEST` spawns a task that answers, waits for
//! the first remote candidate, starts the transports and publishes the
//! connection to the accept queue.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::conn::{Conn, ConnState, PeerState};
use super::error::NetworkError;
use super::transport::{Role, Transport, TransportStack};
use crate::config::ListenConfig;
use crate::protocol::{
    ConnectionId, IceCandidate, NetworkId, SessionDescription, Setup, Signal, SignalType,
};
use crate::signaling::Signaling;

/// Accepts peer connections dialed to the local Network ID
pub struct Listener {
    signaling: Arc<dyn Signaling>,
    network_id: NetworkId,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Conn>>,
    shutdown: CancellationToken,
    read_task: Mutex<Option<JoinHandle<()>>>,
}

impl Listener {
    /// Start answering offers arriving on `signaling`
    pub fn bind(
        signaling: Arc<dyn Signaling>,
        transport: Arc<dyn Transport>,
        config: ListenConfig,
    ) -> Result<Self, NetworkError> {
        config.validate()?;

        let network_id = signaling.network_id();
        let shutdown = CancellationToken::new();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        let dispatcher = Dispatcher {
            signaling: signaling.clone(),
            transport,
            config,
            shutdown: shutdown.clone(),
            incoming: incoming_tx,
            negotiations: HashMap::new(),
        };
        let read_task = tokio::spawn(dispatcher.run());

        info!("Listener bound on network ID {}", network_id);

        Ok(Self {
            signaling,
            network_id,
            incoming: tokio::sync::Mutex::new(incoming_rx),
            shutdown,
            read_task: Mutex::new(Some(read_task)),
        })
    }

    /// Wait for the next open connection
    pub async fn accept(&self) -> Result<Conn, NetworkError> {
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(NetworkError::ListenerClosed),
            conn = incoming.recv() => conn.ok_or(NetworkError::ListenerClosed),
        }
    }

    /// Network ID remote peers dial to reach this listener
    pub fn network_id(&self) -> NetworkId {
        self.network_id
    }

    /// Close the signaling channel, cancel pending negotiations and close
    /// every connection accepted from this listener. Idempotent.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let read_task = self.read_task.lock().take();
        if let Some(read_task) = read_task {
            let _ = read_task.await;
            self.signaling.close().await;
            info!("Listener {} closed", self.network_id);
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Entry of a negotiation known by Connection ID
struct Negotiation {
    remote_network_id: NetworkId,
    candidates: mpsc::UnboundedSender<IceCandidate>,
    peer: Arc<PeerState>,
}

/// Everything a negotiation task needs from the listener
#[derive(Clone)]
struct Context {
    signaling: Arc<dyn Signaling>,
    transport: Arc<dyn Transport>,
    config: ListenConfig,
    incoming: mpsc::UnboundedSender<Conn>,
}

/// State of the signaling read task
struct Dispatcher {
    signaling: Arc<dyn Signaling>,
    transport: Arc<dyn Transport>,
    config: ListenConfig,
    shutdown: CancellationToken,
    incoming: mpsc::UnboundedSender<Conn>,
    negotiations: HashMap<ConnectionId, Negotiation>,
}

impl Dispatcher {
    async fn run(mut self) {
        let (finished_tx, mut finished_rx) = mpsc::unbounded_channel::<ConnectionId>();

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                Some(connection_id) = finished_rx.recv() => {
                    self.negotiations.remove(&connection_id);
                }
                signal = self.signaling.read_signal() => match signal {
                    Ok(signal) => self.dispatch(signal, &finished_tx).await,
                    Err(e) => {
                        warn!("Listener signaling failed: {}", e);
                        break;
                    }
                },
            }
        }

        // Every negotiation token is a child of the shutdown token
        self.shutdown.cancel();
    }

    async fn dispatch(
        &mut self,
        signal: Signal,
        finished: &mpsc::UnboundedSender<ConnectionId>,
    ) {
        match signal.typ {
            SignalType::ConnectRequest => self.handle_request(signal, finished).await,
            SignalType::CandidateAdd => self.handle_candidate(signal),
            SignalType::ConnectError => self.handle_error(signal),
            SignalType::ConnectResponse => {
                warn!(
                    "Listener ignoring CONNECTRESPONSE for connection {} from {}",
                    signal.connection_id, signal.network_id
                );
            }
        }
    }

    async fn handle_request(
        &mut self,
        signal: Signal,
        finished: &mpsc::UnboundedSender<ConnectionId>,
    ) {
        let connection_id = signal.connection_id;
        let remote_network_id = signal.network_id;

        if self.negotiations.contains_key(&connection_id) {
            warn!(
                "Ignoring repeated CONNECTREQUEST for connection {} from {}",
                connection_id, remote_network_id
            );
            return;
        }

        let offer = match SessionDescription::parse(&signal.data) {
            Ok(offer) => offer,
            Err(e) => {
                warn!(
                    "Rejecting offer {} from {}: {}",
                    connection_id, remote_network_id, e
                );
                let reply = Signal::error(connection_id, e.error_code(), remote_network_id);
                if let Err(e) = self.signaling.write_signal(&reply).await {
                    warn!("Failed to send CONNECTERROR: {}", e);
                }
                return;
            }
        };

        debug!(
            "Received offer {} from {}",
            connection_id, remote_network_id
        );

        let peer = Arc::new(PeerState::new(
            Role::Listener,
            connection_id,
            self.signaling.network_id(),
            remote_network_id,
            self.shutdown.child_token(),
        ));
        let (candidates_tx, candidates_rx) = mpsc::unbounded_channel();
        self.negotiations.insert(
            connection_id,
            Negotiation {
                remote_network_id,
                candidates: candidates_tx,
                peer: peer.clone(),
            },
        );

        let context = Context {
            signaling: self.signaling.clone(),
            transport: self.transport.clone(),
            config: self.config.clone(),
            incoming: self.incoming.clone(),
        };
        tokio::spawn(answer(context, peer, offer, candidates_rx, finished.clone()));
    }

    fn handle_candidate(&self, signal: Signal) {
        let Some(negotiation) = self.known(&signal) else {
            return;
        };
        match IceCandidate::parse(&signal.data) {
            Ok(candidate) => {
                let _ = negotiation.candidates.send(candidate);
            }
            Err(e) => warn!(
                "Ignoring bad candidate for connection {}: {}",
                signal.connection_id, e
            ),
        }
    }

    fn handle_error(&self, signal: Signal) {
        let Some(negotiation) = self.known(&signal) else {
            return;
        };
        let code = signal
            .error_code()
            .unwrap_or(crate::protocol::ErrorCode::SignalingUnknownError);
        info!(
            "Connection {} rejected by {}: {}",
            signal.connection_id, signal.network_id, code
        );
        negotiation.peer.fail(&NetworkError::Remote { code });
    }

    /// Negotiation a signal belongs to, if any
    fn known(&self, signal: &Signal) -> Option<&Negotiation> {
        match self.negotiations.get(&signal.connection_id) {
            Some(negotiation) if negotiation.remote_network_id == signal.network_id => {
                Some(negotiation)
            }
            Some(_) => {
                warn!(
                    "Ignoring {} for connection {} from unexpected network {}",
                    signal.typ, signal.connection_id, signal.network_id
                );
                None
            }
            None => {
                warn!(
                    "Ignoring {} for unknown connection {}",
                    signal.typ, signal.connection_id
                );
                None
            }
        }
    }
}

/// Per-connection task: negotiate, publish, then keep feeding candidates
/// until the connection closes
async fn answer(
    context: Context,
    peer: Arc<PeerState>,
    offer: SessionDescription,
    mut candidates: mpsc::UnboundedReceiver<IceCandidate>,
    finished: mpsc::UnboundedSender<ConnectionId>,
) {
    let connection_id = peer.connection_id;
    let mut stack: Option<Arc<dyn TransportStack>> = None;

    let result = tokio::select! {
        biased;
        _ = peer.closed.cancelled() => Err(NetworkError::ConnectionClosed),
        result = tokio::time::timeout(
            context.config.negotiation_timeout(),
            negotiate(&context, &peer, &offer, &mut candidates, &mut stack),
        ) => result.unwrap_or(Err(NetworkError::NegotiationTimeout)),
    };

    match result {
        Ok(conn) => {
            let stack = stack.take();
            if context.incoming.send(conn).is_err() {
                debug!("Listener gone before connection {} was accepted", connection_id);
            } else if let Some(stack) = stack {
                forward_candidates(&peer, stack.as_ref(), &mut candidates).await;
            }
        }
        Err(e) => {
            warn!("Negotiation {} failed: {}", connection_id, e);
            // Closed means the remote rejected us or the listener is closing
            if !matches!(e, NetworkError::ConnectionClosed) {
                let reply = Signal::error(connection_id, e.error_code(), peer.remote_network_id);
                if let Err(e) = context.signaling.write_signal(&reply).await {
                    debug!("Failed to send CONNECTERROR: {}", e);
                }
            }
            peer.fail(&e);
            if let Some(stack) = stack.take() {
                stack.close().await;
            }
            peer.mark_released();
        }
    }

    let _ = finished.send(connection_id);
}

/// Candidates trickled after the connection opened
async fn forward_candidates(
    peer: &PeerState,
    stack: &dyn TransportStack,
    candidates: &mut mpsc::UnboundedReceiver<IceCandidate>,
) {
    loop {
        let candidate = tokio::select! {
            biased;
            _ = peer.closed.cancelled() => return,
            candidate = candidates.recv() => candidate,
        };
        let Some(candidate) = candidate else {
            return;
        };
        if let Err(e) = stack.add_remote_candidate(&candidate).await {
            debug!("Connection {}: late candidate rejected: {}", peer.connection_id, e);
        }
        peer.push_remote_candidate(candidate);
    }
}

/// The answerer sequence. Stores the gathered stack in `slot` so the caller
/// can release it when negotiation fails or is cancelled.
async fn negotiate(
    context: &Context,
    peer: &Arc<PeerState>,
    offer: &SessionDescription,
    candidates: &mut mpsc::UnboundedReceiver<IceCandidate>,
    slot: &mut Option<Arc<dyn TransportStack>>,
) -> Result<Conn, NetworkError> {
    let signaling = &context.signaling;
    let remote = peer.remote_network_id;
    let connection_id = peer.connection_id;

    let credentials = match signaling.credentials().await {
        Ok(credentials) => credentials,
        Err(NetworkError::SignalingClosed) => return Err(NetworkError::SignalingClosed),
        Err(e) => {
            debug!("Credentials unavailable: {}", e);
            return Err(NetworkError::TurnAuthFailed);
        }
    };

    let stack: Arc<dyn TransportStack> = Arc::from(
        context
            .transport
            .gather(credentials.as_ref())
            .await
            .map_err(|e| NetworkError::GatheringFailed(e.to_string()))?,
    );
    *slot = Some(stack.clone());

    let local = stack.local_parameters();
    peer.set_local_candidates(local.candidates.clone());

    let answer = SessionDescription {
        session_id: rand::thread_rng().gen_range(1..i64::MAX as u64),
        ice_ufrag: local.ice_ufrag.clone(),
        ice_pwd: local.ice_pwd.clone(),
        fingerprint: local.fingerprint.clone(),
        setup: Setup::ActPass,
        max_message_size: local.max_message_size,
    };
    signaling
        .write_signal(&Signal::new(
            SignalType::ConnectResponse,
            connection_id,
            answer.encode(),
            remote,
        ))
        .await?;
    for (index, candidate) in local.candidates.iter().enumerate() {
        signaling
            .write_signal(&Signal::new(
                SignalType::CandidateAdd,
                connection_id,
                candidate.encode(&local.ice_ufrag, index),
                remote,
            ))
            .await?;
    }
    peer.advance(ConnState::Negotiating);

    // Transports start on the first remote candidate
    let first = candidates.recv().await.ok_or(NetworkError::ConnectionClosed)?;
    add_candidate(peer, stack.as_ref(), first).await?;
    peer.advance(ConnState::Connecting);

    let channels = {
        let start = stack.start(Role::Listener, offer);
        tokio::pin!(start);
        loop {
            tokio::select! {
                started = &mut start => {
                    break started
                        .map_err(|e| NetworkError::TransportStartFailed(e.to_string()))?;
                }
                Some(candidate) = candidates.recv() => {
                    add_candidate(peer, stack.as_ref(), candidate).await?;
                }
            }
        }
    };

    Ok(Conn::spawn(
        peer.clone(),
        stack,
        channels,
        offer.max_message_size,
    ))
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
