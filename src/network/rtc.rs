//! ICE, DTLS and SCTP transports on webrtc-rs
//!
//! Built from the protocol crates webrtc-rs re-exports: an ICE agent yields
//! a connection that carries DTLS, which carries one SCTP association. The
//! dialer opens both data channels with in-band DCEP on its own stream
//! identifiers; the listener accepts them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use webrtc::data::data_channel::{Config as ChannelConfig, DataChannel as SctpChannel};
use webrtc::data::message::message_channel_open::{ChannelType, CHANNEL_PRIORITY_NORMAL};
use webrtc::dtls::config::{ClientAuthType, Config as DtlsConfig};
use webrtc::dtls::conn::DTLSConn;
use webrtc::dtls::crypto::Certificate;
use webrtc::ice::agent::agent_config::AgentConfig;
use webrtc::ice::agent::Agent;
use webrtc::ice::candidate::candidate_base::unmarshal_candidate;
use webrtc::ice::candidate::{Candidate, CandidateType as AgentCandidateType};
use webrtc::ice::mdns::MulticastDnsMode;
use webrtc::ice::network_type::NetworkType;
use webrtc::ice::url::{SchemeType, Url};
use webrtc::sctp::association::{Association, Config as AssociationConfig};
use webrtc::util::Conn;

use super::transport::{
    ChannelEvent, ChannelKind, DataChannel, DataChannels, LocalParameters, Role, Transport,
    TransportError, TransportStack,
};
use crate::protocol::{
    CandidateType, Credentials, Fingerprint, IceCandidate, SessionDescription,
    DEFAULT_MAX_MESSAGE_SIZE, SCTP_PORT,
};

/// Stream identifier of the reliable channel. The dialer is the DTLS
/// client, which owns the even identifiers.
const RELIABLE_STREAM_ID: u16 = 0;

/// Stream identifier of the unreliable channel
const UNRELIABLE_STREAM_ID: u16 = 2;

const READ_BUFFER_SIZE: usize = u16::MAX as usize;

const FINGERPRINT_ALGORITHM: &str = "sha-256";

/// Transport backed by webrtc-rs
#[derive(Debug, Clone, Default)]
pub struct WebRtcTransport {
    include_loopback: bool,
}

impl WebRtcTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also gather loopback host candidates, so two peers on one machine
    /// can connect without a usable network interface
    pub fn with_loopback_candidates(mut self, include: bool) -> Self {
        self.include_loopback = include;
        self
    }
}

/// STUN and TURN URLs from the relay-issued credentials. URLs the ICE agent
/// cannot parse are skipped.
fn ice_urls(credentials: Option<&Credentials>) -> Vec<Url> {
    let Some(credentials) = credentials else {
        return Vec::new();
    };

    let mut urls = Vec::new();
    for server in &credentials.ice_servers {
        for raw in &server.urls {
            match Url::parse_url(raw) {
                Ok(mut url) => {
                    if matches!(url.scheme, SchemeType::Turn | SchemeType::Turns) {
                        url.username.clone_from(&server.username);
                        url.password.clone_from(&server.password);
                    }
                    urls.push(url);
                }
                Err(e) => warn!("Skipping ICE server {:?}: {}", raw, e),
            }
        }
    }
    urls
}

fn from_agent_candidate(candidate: &dyn Candidate) -> IceCandidate {
    let typ = match candidate.candidate_type() {
        AgentCandidateType::ServerReflexive => CandidateType::Srflx,
        AgentCandidateType::PeerReflexive => CandidateType::Prflx,
        AgentCandidateType::Relay => CandidateType::Relay,
        _ => CandidateType::Host,
    };
    let related = candidate.related_address();

    IceCandidate {
        foundation: candidate.foundation(),
        component: candidate.component(),
        priority: candidate.priority(),
        address: candidate.address(),
        port: candidate.port(),
        typ,
        related_address: related.as_ref().map(|r| r.address.clone()),
        related_port: related.map(|r| r.port),
    }
}

fn to_agent_candidate(
    candidate: &IceCandidate,
) -> Result<impl Candidate + Send + Sync, TransportError> {
    let mut record = format!(
        "{} {} udp {} {} {} typ {}",
        candidate.foundation,
        candidate.component,
        candidate.priority,
        candidate.address,
        candidate.port,
        candidate.typ
    );
    if let (Some(address), Some(port)) = (&candidate.related_address, candidate.related_port) {
        record.push_str(&format!(" raddr {} rport {}", address, port));
    }

    unmarshal_candidate(&record).map_err(|e| TransportError::Ice(e.to_string()))
}

/// Upper-case, colon separated SHA-256 of a DER certificate
fn fingerprint_of(der: &[u8]) -> String {
    Sha256::digest(der)
        .iter()
        .map(|byte| format!("{:02X}", byte))
        .collect::<Vec<_>>()
        .join(":")
}

fn verify_fingerprint(
    peer_certificates: &[Vec<u8>],
    expected: &Fingerprint,
) -> Result<(), TransportError> {
    if !expected.algorithm.eq_ignore_ascii_case(FINGERPRINT_ALGORITHM) {
        return Err(TransportError::Dtls(format!(
            "unsupported fingerprint algorithm {}",
            expected.algorithm
        )));
    }
    let certificate = peer_certificates
        .first()
        .ok_or_else(|| TransportError::Dtls("no remote certificate".to_string()))?;
    if !fingerprint_of(certificate).eq_ignore_ascii_case(&expected.value) {
        return Err(TransportError::Dtls("remote fingerprint mismatch".to_string()));
    }
    Ok(())
}

/// DCEP parameters and stream identifier of a channel the dialer opens
fn channel_config(kind: ChannelKind, max_message_size: u32) -> (u16, ChannelConfig) {
    let (stream_id, channel_type) = match kind {
        ChannelKind::Reliable => (RELIABLE_STREAM_ID, ChannelType::Reliable),
        ChannelKind::Unreliable => (
            UNRELIABLE_STREAM_ID,
            ChannelType::PartialReliableRexmitUnordered,
        ),
    };

    let config = ChannelConfig {
        channel_type,
        negotiated: false,
        priority: CHANNEL_PRIORITY_NORMAL,
        reliability_parameter: 0,
        label: kind.label().to_string(),
        protocol: String::new(),
        max_message_size,
    };
    (stream_id, config)
}

async fn dial_channel(
    association: &Arc<Association>,
    kind: ChannelKind,
) -> Result<Arc<SctpChannel>, TransportError> {
    let (stream_id, config) = channel_config(kind, association.max_message_size());
    SctpChannel::dial(association, stream_id, config)
        .await
        .map(Arc::new)
        .map_err(|e| TransportError::Sctp(e.to_string()))
}

async fn gather_candidates(agent: &Agent) -> Result<Vec<IceCandidate>, TransportError> {
    let gathering = |e: webrtc::ice::Error| TransportError::Gathering(e.to_string());

    let (done_tx, mut done_rx) = mpsc::channel::<()>(1);
    let mut done_tx = Some(done_tx);
    agent.on_candidate(Box::new(move |candidate: Option<Arc<dyn Candidate + Send + Sync>>| {
        if candidate.is_none() {
            done_tx.take();
        }
        Box::pin(async {})
    }));

    agent.gather_candidates().map_err(gathering)?;
    let _ = done_rx.recv().await;

    Ok(agent
        .get_local_candidates()
        .await
        .map_err(gathering)?
        .iter()
        .filter(|c| c.network_type().is_udp())
        .map(|c| from_agent_candidate(c.as_ref()))
        .collect())
}

#[async_trait]
impl Transport for WebRtcTransport {
    async fn gather(
        &self,
        credentials: Option<&Credentials>,
    ) -> Result<Box<dyn TransportStack>, TransportError> {
        let certificate = Certificate::generate_self_signed(vec!["nethernet".to_string()])
            .map_err(|e| TransportError::Dtls(e.to_string()))?;
        let fingerprint = certificate
            .certificate
            .first()
            .map(|der| fingerprint_of(der.as_ref()))
            .ok_or_else(|| TransportError::Dtls("no local certificate".to_string()))?;

        let agent = Agent::new(AgentConfig {
            urls: ice_urls(credentials),
            network_types: vec![NetworkType::Udp4, NetworkType::Udp6],
            multicast_dns_mode: MulticastDnsMode::Disabled,
            include_loopback: self.include_loopback,
            ..Default::default()
        })
        .await
        .map_err(|e| TransportError::Gathering(e.to_string()))?;

        let candidates = match gather_candidates(&agent).await {
            Ok(candidates) => candidates,
            Err(e) => {
                if let Err(close) = agent.close().await {
                    debug!("Closing ICE agent: {}", close);
                }
                return Err(e);
            }
        };
        let (ice_ufrag, ice_pwd) = agent.get_local_user_credentials().await;

        debug!("Gathered {} local candidates", candidates.len());

        Ok(Box::new(WebRtcStack {
            agent: Arc::new(agent),
            certificate,
            local: LocalParameters {
                ice_ufrag,
                ice_pwd,
                fingerprint: Fingerprint {
                    algorithm: FINGERPRINT_ALGORITHM.to_string(),
                    value: fingerprint,
                },
                max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
                candidates,
            },
            cancel_dial: Mutex::new(None),
            dtls: Mutex::new(None),
            association: Mutex::new(None),
            channels: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            closed: CancellationToken::new(),
        }))
    }
}

struct WebRtcStack {
    agent: Arc<Agent>,
    certificate: Certificate,
    local: LocalParameters,
    // Dropping the sender aborts a pending ICE dial or accept
    cancel_dial: Mutex<Option<mpsc::Sender<()>>>,
    dtls: Mutex<Option<Arc<DTLSConn>>>,
    association: Mutex<Option<Arc<Association>>>,
    channels: Mutex<Vec<Arc<SctpChannel>>>,
    started: AtomicBool,
    closed: CancellationToken,
}

impl WebRtcStack {
    async fn connect_ice(
        &self,
        role: Role,
        remote: &SessionDescription,
    ) -> Result<Arc<dyn Conn + Send + Sync>, TransportError> {
        let ice = |e: webrtc::ice::Error| TransportError::Ice(e.to_string());

        let (cancel_tx, cancel_rx) = mpsc::channel(1);
        *self.cancel_dial.lock() = Some(cancel_tx);
        if self.closed.is_cancelled() {
            return Err(TransportError::ChannelClosed);
        }

        let (ufrag, pwd) = (remote.ice_ufrag.clone(), remote.ice_pwd.clone());
        let conn: Arc<dyn Conn + Send + Sync> = match role {
            Role::Dialer => self.agent.dial(cancel_rx, ufrag, pwd).await.map_err(ice)?,
            Role::Listener => self.agent.accept(cancel_rx, ufrag, pwd).await.map_err(ice)?,
        };
        Ok(conn)
    }

    async fn connect_dtls(
        &self,
        conn: Arc<dyn Conn + Send + Sync>,
        role: Role,
        remote: &SessionDescription,
    ) -> Result<Arc<DTLSConn>, TransportError> {
        let config = DtlsConfig {
            certificates: vec![self.certificate.clone()],
            client_auth: ClientAuthType::RequireAnyClientCert,
            insecure_skip_verify: true,
            ..Default::default()
        };

        let dtls = DTLSConn::new(conn, config, role == Role::Dialer, None)
            .await
            .map_err(|e| TransportError::Dtls(e.to_string()))?;

        let peer_certificates = dtls.connection_state().await.peer_certificates;
        if let Err(e) = verify_fingerprint(&peer_certificates, &remote.fingerprint) {
            if let Err(close) = dtls.close().await {
                debug!("Closing DTLS connection: {}", close);
            }
            return Err(e);
        }

        let dtls = Arc::new(dtls);
        *self.dtls.lock() = Some(Arc::clone(&dtls));
        Ok(dtls)
    }

    async fn open_channels(
        &self,
        association: &Arc<Association>,
    ) -> Result<(Arc<SctpChannel>, Arc<SctpChannel>), TransportError> {
        let reliable = dial_channel(association, ChannelKind::Reliable).await?;
        let unreliable = dial_channel(association, ChannelKind::Unreliable).await?;
        Ok((reliable, unreliable))
    }

    async fn accept_channels(
        &self,
        association: &Arc<Association>,
    ) -> Result<(Arc<SctpChannel>, Arc<SctpChannel>), TransportError> {
        let existing: [SctpChannel; 0] = [];
        let mut reliable = None;
        let mut unreliable = None;

        while reliable.is_none() || unreliable.is_none() {
            let config = ChannelConfig {
                max_message_size: association.max_message_size(),
                ..Default::default()
            };
            let channel = SctpChannel::accept(association, config, &existing)
                .await
                .map_err(|e| TransportError::Sctp(e.to_string()))?;

            match ChannelKind::from_label(&channel.config.label) {
                Some(ChannelKind::Reliable) => reliable = Some(Arc::new(channel)),
                Some(ChannelKind::Unreliable) => unreliable = Some(Arc::new(channel)),
                None => warn!("Ignoring data channel with label {:?}", channel.config.label),
            }
        }

        match (reliable, unreliable) {
            (Some(reliable), Some(unreliable)) => Ok((reliable, unreliable)),
            _ => Err(TransportError::ChannelClosed),
        }
    }

    /// Pump inbound messages of one channel into the event queue until the
    /// stream ends or the stack closes
    fn spawn_reader(
        &self,
        channel: &Arc<SctpChannel>,
        kind: ChannelKind,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> RtcChannel {
        let open = self.closed.child_token();
        let reader = Arc::clone(channel);
        let done = open.clone();

        tokio::spawn(async move {
            let mut buffer = vec![0u8; READ_BUFFER_SIZE];
            loop {
                let result = tokio::select! {
                    _ = done.cancelled() => break,
                    result = reader.read_data_channel(&mut buffer) => result,
                };
                match result {
                    // Stream reset by the remote or shut down locally
                    Ok((0, _)) => break,
                    Ok((n, _)) => {
                        let data = Bytes::copy_from_slice(&buffer[..n]);
                        if events.send(ChannelEvent::Message { kind, data }).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("Reading {}: {}", kind.label(), e);
                        break;
                    }
                }
            }
            done.cancel();
            let _ = events.send(ChannelEvent::Closed(kind));
        });

        RtcChannel {
            channel: Arc::clone(channel),
            open,
        }
    }
}

#[async_trait]
impl TransportStack for WebRtcStack {
    fn local_parameters(&self) -> &LocalParameters {
        &self.local
    }

    async fn add_remote_candidate(
        &self,
        candidate: &IceCandidate,
    ) -> Result<(), TransportError> {
        let candidate: Arc<dyn Candidate + Send + Sync> =
            Arc::new(to_agent_candidate(candidate)?);
        self.agent
            .add_remote_candidate(&candidate)
            .map_err(|e| TransportError::Ice(e.to_string()))
    }

    async fn start(
        &self,
        role: Role,
        remote: &SessionDescription,
    ) -> Result<DataChannels, TransportError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(TransportError::Ice("transport already started".to_string()));
        }

        let conn = self.connect_ice(role, remote).await?;
        debug!("ICE connected as {:?}", role);

        let dtls = self.connect_dtls(conn, role, remote).await?;

        let max_message_size = match remote.max_message_size {
            0 => DEFAULT_MAX_MESSAGE_SIZE,
            size => size,
        };
        let association = Association::client(AssociationConfig {
            net_conn: dtls as Arc<dyn Conn + Send + Sync>,
            max_receive_buffer_size: 0,
            max_message_size,
            name: String::new(),
            local_port: SCTP_PORT,
            remote_port: SCTP_PORT,
        })
        .await
        .map_err(|e| TransportError::Sctp(e.to_string()))?;
        let association = Arc::new(association);
        *self.association.lock() = Some(Arc::clone(&association));

        let (reliable, unreliable) = match role {
            Role::Dialer => self.open_channels(&association).await?,
            Role::Listener => self.accept_channels(&association).await?,
        };
        self.channels
            .lock()
            .extend([Arc::clone(&reliable), Arc::clone(&unreliable)]);
        debug!(
            "Data channels open on streams {} and {}",
            reliable.stream_identifier(),
            unreliable.stream_identifier()
        );

        let (events_tx, events) = mpsc::unbounded_channel();
        let reliable = self.spawn_reader(&reliable, ChannelKind::Reliable, events_tx.clone());
        let unreliable = self.spawn_reader(&unreliable, ChannelKind::Unreliable, events_tx);

        Ok(DataChannels {
            reliable: Box::new(reliable),
            unreliable: Box::new(unreliable),
            events,
        })
    }

    async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        self.cancel_dial.lock().take();

        let channels: Vec<_> = self.channels.lock().drain(..).collect();
        for channel in channels {
            if let Err(e) = channel.close().await {
                debug!("Closing data channel {}: {}", channel.config.label, e);
            }
        }

        let association = self.association.lock().take();
        if let Some(association) = association {
            if let Err(e) = association.close().await {
                debug!("Closing SCTP association: {}", e);
            }
        }

        let dtls = self.dtls.lock().take();
        if let Some(dtls) = dtls {
            if let Err(e) = dtls.close().await {
                debug!("Closing DTLS connection: {}", e);
            }
        }

        if let Err(e) = self.agent.close().await {
            debug!("Closing ICE agent: {}", e);
        }
    }
}

struct RtcChannel {
    channel: Arc<SctpChannel>,
    open: CancellationToken,
}

#[async_trait]
impl DataChannel for RtcChannel {
    async fn send(&self, data: Bytes) -> Result<usize, TransportError> {
        if self.open.is_cancelled() {
            return Err(TransportError::ChannelClosed);
        }
        self.channel
            .write(&data)
            .await
            .map_err(|e| TransportError::Sctp(e.to_string()))
    }
}
