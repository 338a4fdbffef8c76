//! Seams between the connection state machine and the ICE/DTLS/SCTP stack
//!
//! A [`Transport`] gathers candidates and hands back a [`TransportStack`]
//! that owns the ICE, DTLS and SCTP handles of one peer connection. Once
//! started, the stack reports data channel activity as [`ChannelEvent`]s on
//! a queue instead of calling back into the connection.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::{Credentials, Fingerprint, IceCandidate, SessionDescription};

/// Label of the ordered, reliable data channel
pub const RELIABLE_CHANNEL: &str = "ReliableDataChannel";

/// Label of the unordered, best-effort data channel
pub const UNRELIABLE_CHANNEL: &str = "UnreliableDataChannel";

/// Role of the local side of a negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Answerer: ICE controlled, DTLS server
    Listener,
    /// Offerer: ICE controlling, DTLS client
    Dialer,
}

/// Which of the two data channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Reliable,
    Unreliable,
}

impl ChannelKind {
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            RELIABLE_CHANNEL => Some(Self::Reliable),
            UNRELIABLE_CHANNEL => Some(Self::Unreliable),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Reliable => RELIABLE_CHANNEL,
            Self::Unreliable => UNRELIABLE_CHANNEL,
        }
    }
}

/// Activity on an open data channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Message { kind: ChannelKind, data: Bytes },
    Closed(ChannelKind),
}

/// Errors raised by a transport implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("gathering: {0}")]
    Gathering(String),

    #[error("ICE: {0}")]
    Ice(String),

    #[error("DTLS: {0}")]
    Dtls(String),

    #[error("SCTP: {0}")]
    Sctp(String),

    #[error("data channel closed")]
    ChannelClosed,
}

/// Local parameters known once gathering completed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalParameters {
    pub ice_ufrag: String,
    pub ice_pwd: String,
    pub fingerprint: Fingerprint,
    pub max_message_size: u32,
    pub candidates: Vec<IceCandidate>,
}

/// Sending half of one data channel
#[async_trait]
pub trait DataChannel: Send + Sync {
    /// Send one message, returning the number of bytes written
    async fn send(&self, data: Bytes) -> Result<usize, TransportError>;
}

/// Both data channels of a started stack plus the inbound event queue
pub struct DataChannels {
    pub reliable: Box<dyn DataChannel>,
    pub unreliable: Box<dyn DataChannel>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

/// Produces a gathered transport stack per negotiation
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Gather local candidates, seeded with the relay-issued credentials,
    /// and return once end-of-candidates has been signalled
    async fn gather(
        &self,
        credentials: Option<&Credentials>,
    ) -> Result<Box<dyn TransportStack>, TransportError>;
}

/// ICE, DTLS and SCTP handles of one peer connection
#[async_trait]
pub trait TransportStack: Send + Sync {
    /// Parameters for the local description. Fixed after gathering.
    fn local_parameters(&self) -> &LocalParameters;

    async fn add_remote_candidate(&self, candidate: &IceCandidate)
        -> Result<(), TransportError>;

    /// Start ICE, then DTLS, then SCTP, and wait until both data channels
    /// are open
    async fn start(
        &self,
        role: Role,
        remote: &SessionDescription,
    ) -> Result<DataChannels, TransportError>;

    /// Release data channels, SCTP, DTLS and ICE, in that order. Idempotent.
    async fn close(&self);
}
