//! In-process transport stack
//!
//! Stacks gathered from the same [`LoopbackTransport`] pair up by ICE ufrag
//! once both sides have been started. No sockets are opened; messages are
//! moved through channels. Useful for exercising the negotiation and data
//! path without a network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::transport::{
    ChannelEvent, ChannelKind, DataChannel, DataChannels, LocalParameters, Role, Transport,
    TransportError, TransportStack,
};
use crate::protocol::{
    CandidateType, Credentials, Fingerprint, IceCandidate, SessionDescription,
    DEFAULT_MAX_MESSAGE_SIZE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Gathered,
    Started,
    Closed,
}

struct Endpoint {
    inbox: mpsc::UnboundedSender<ChannelEvent>,
    phase: watch::Receiver<Phase>,
}

/// Factory for stacks that talk to each other in memory
#[derive(Clone, Default)]
pub struct LoopbackTransport {
    endpoints: Arc<Mutex<HashMap<String, Endpoint>>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of gathered stacks that have not been closed
    pub fn open_stacks(&self) -> usize {
        self.endpoints.lock().len()
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn gather(
        &self,
        _credentials: Option<&Credentials>,
    ) -> Result<Box<dyn TransportStack>, TransportError> {
        let mut rng = rand::thread_rng();
        let ice_ufrag: String = (&mut rng)
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(char::from)
            .collect();
        let ice_pwd: String = (&mut rng)
            .sample_iter(&Alphanumeric)
            .take(24)
            .map(char::from)
            .collect();
        let fingerprint = (0..32)
            .map(|_| format!("{:02X}", rng.gen::<u8>()))
            .collect::<Vec<_>>()
            .join(":");

        let candidate = IceCandidate {
            foundation: rng.gen::<u32>().to_string(),
            component: 1,
            priority: 2_130_706_431,
            address: "127.0.0.1".to_string(),
            port: rng.gen_range(49152..65535),
            typ: CandidateType::Host,
            related_address: None,
            related_port: None,
        };

        let (inbox, events) = mpsc::unbounded_channel();
        let (phase_tx, phase_rx) = watch::channel(Phase::Gathered);

        self.endpoints.lock().insert(
            ice_ufrag.clone(),
            Endpoint {
                inbox,
                phase: phase_rx,
            },
        );
        debug!("Loopback stack {} gathered", ice_ufrag);

        Ok(Box::new(LoopbackStack {
            endpoints: self.endpoints.clone(),
            local: LocalParameters {
                ice_ufrag,
                ice_pwd,
                fingerprint: Fingerprint {
                    algorithm: "sha-256".to_string(),
                    value: fingerprint,
                },
                max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
                candidates: vec![candidate],
            },
            events: Mutex::new(Some(events)),
            phase: phase_tx,
            peer: Mutex::new(None),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

struct LoopbackStack {
    endpoints: Arc<Mutex<HashMap<String, Endpoint>>>,
    local: LocalParameters,
    events: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
    phase: watch::Sender<Phase>,
    peer: Mutex<Option<mpsc::UnboundedSender<ChannelEvent>>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl TransportStack for LoopbackStack {
    fn local_parameters(&self) -> &LocalParameters {
        &self.local
    }

    async fn add_remote_candidate(
        &self,
        _candidate: &IceCandidate,
    ) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Ice("transport closed".to_string()));
        }
        Ok(())
    }

    async fn start(
        &self,
        role: Role,
        remote: &SessionDescription,
    ) -> Result<DataChannels, TransportError> {
        let events = self
            .events
            .lock()
            .take()
            .ok_or_else(|| TransportError::Ice("transport already started".to_string()))?;

        let (inbox, mut remote_phase) = {
            let endpoints = self.endpoints.lock();
            let endpoint = endpoints.get(&remote.ice_ufrag).ok_or_else(|| {
                TransportError::Ice(format!("no peer with ufrag {}", remote.ice_ufrag))
            })?;
            (endpoint.inbox.clone(), endpoint.phase.clone())
        };

        self.phase.send_replace(Phase::Started);
        let phase = remote_phase
            .wait_for(|phase| *phase != Phase::Gathered)
            .await
            .map(|phase| *phase)
            .unwrap_or(Phase::Closed);
        if phase == Phase::Closed || self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Ice(
                "peer closed before connecting".to_string(),
            ));
        }

        debug!(
            "Loopback stack {} connected to {} as {:?}",
            self.local.ice_ufrag, remote.ice_ufrag, role
        );
        *self.peer.lock() = Some(inbox.clone());

        Ok(DataChannels {
            reliable: Box::new(LoopbackChannel {
                kind: ChannelKind::Reliable,
                peer: inbox.clone(),
                closed: self.closed.clone(),
            }),
            unreliable: Box::new(LoopbackChannel {
                kind: ChannelKind::Unreliable,
                peer: inbox,
                closed: self.closed.clone(),
            }),
            events,
        })
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(peer) = self.peer.lock().take() {
            let _ = peer.send(ChannelEvent::Closed(ChannelKind::Unreliable));
            let _ = peer.send(ChannelEvent::Closed(ChannelKind::Reliable));
        }
        self.endpoints.lock().remove(&self.local.ice_ufrag);
        self.phase.send_replace(Phase::Closed);
        debug!("Loopback stack {} closed", self.local.ice_ufrag);
    }
}

struct LoopbackChannel {
    kind: ChannelKind,
    peer: mpsc::UnboundedSender<ChannelEvent>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl DataChannel for LoopbackChannel {
    async fn send(&self, data: Bytes) -> Result<usize, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed);
        }
        let len = data.len();
        self.peer
            .send(ChannelEvent::Message {
                kind: self.kind,
                data,
            })
            .map_err(|_| TransportError::ChannelClosed)?;
        Ok(len)
    }
}
