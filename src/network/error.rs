//! Network error types

use thiserror::Error;

use super::framing::ReassemblyError;
use crate::protocol::{ConnectionId, ErrorCode, NetworkId};

/// Errors that can occur in the signaling and peer connection layers
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Signaling channel closed")]
    SignalingClosed,

    #[error("Unauthorized by signaling server")]
    Unauthorized,

    #[error("Bad remote description: {0}")]
    BadRemoteDescription(String),

    #[error("TURN credentials unavailable")]
    TurnAuthFailed,

    #[error("ICE gathering failed: {0}")]
    GatheringFailed(String),

    #[error("Transport start failed: {0}")]
    TransportStartFailed(String),

    #[error("Negotiation timeout")]
    NegotiationTimeout,

    #[error("Dial timeout")]
    DialTimeout,

    #[error(transparent)]
    Reassembly(#[from] ReassemblyError),

    #[error("Message of {0} bytes exceeds the framing limit")]
    MessageTooLarge(usize),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Listener closed")]
    ListenerClosed,

    #[error("Unknown connection {0}")]
    UnknownConnection(ConnectionId),

    #[error("Remote peer rejected connection: {code}")]
    Remote { code: ErrorCode },

    #[error("Invalid signal: {0}")]
    InvalidSignal(String),

    #[error("No address known for network {0}")]
    UnknownNetwork(NetworkId),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Not implemented")]
    NotImplemented,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl NetworkError {
    /// `CONNECTERROR` code reported to the remote peer when a negotiation
    /// fails locally with this error
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::BadRemoteDescription(_) => ErrorCode::FailedToSetRemoteDescription,
            Self::TurnAuthFailed => ErrorCode::SignalingTurnAuthFailed,
            Self::GatheringFailed(_) => ErrorCode::FailedToCreatePeerConnection,
            Self::TransportStartFailed(_) => ErrorCode::Ice,
            Self::NegotiationTimeout | Self::DialTimeout => ErrorCode::NegotiationTimeout,
            Self::InvalidSignal(_) => ErrorCode::SignalingParsingFailure,
            Self::SignalingClosed | Self::Signaling(_) => ErrorCode::SignalingFailedToSend,
            Self::Remote { code } => *code,
            _ => ErrorCode::SignalingUnknownError,
        }
    }
}
