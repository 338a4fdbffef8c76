//! Signal records exchanged through a signaling channel
//!
//! Wire form: `<TYPE> <CONNECTION ID> <PAYLOAD>`. The payload is taken
//! verbatim up to the end of the record and may contain spaces and newlines
//! (it carries SDP for offers and answers).

use std::fmt;
use std::str::FromStr;

use crate::network::NetworkError;

/// 64-bit identifier of a node on the signaling plane
pub type NetworkId = u64;

/// 64-bit identifier of one peer connection negotiation, chosen by the dialer
pub type ConnectionId = u64;

/// Kind of a signal record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalType {
    /// Offer from the dialer
    ConnectRequest,
    /// Answer from the listener
    ConnectResponse,
    /// Trickled ICE candidate
    CandidateAdd,
    /// Negotiation failure carrying an [`ErrorCode`]
    ConnectError,
}

impl SignalType {
    /// Literal type name used on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectRequest => "CONNECTREQUEST",
            Self::ConnectResponse => "CONNECTRESPONSE",
            Self::CandidateAdd => "CANDIDATEADD",
            Self::ConnectError => "CONNECTERROR",
        }
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalType {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CONNECTREQUEST" => Ok(Self::ConnectRequest),
            "CONNECTRESPONSE" => Ok(Self::ConnectResponse),
            "CANDIDATEADD" => Ok(Self::CandidateAdd),
            "CONNECTERROR" => Ok(Self::ConnectError),
            other => Err(NetworkError::InvalidSignal(format!(
                "unknown signal type {:?}",
                other
            ))),
        }
    }
}

/// Numeric `CONNECTERROR` codes. The numbers are part of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    None = 0,
    DestinationNotLoggedIn = 1,
    NegotiationTimeout = 2,
    WrongTransportVersion = 3,
    FailedToCreatePeerConnection = 4,
    Ice = 5,
    ConnectRequest = 6,
    ConnectResponse = 7,
    CandidateAdd = 8,
    InactivityTimeout = 9,
    FailedToCreateOffer = 10,
    FailedToCreateAnswer = 11,
    FailedToSetLocalDescription = 12,
    FailedToSetRemoteDescription = 13,
    NegotiationTimeoutWaitingForResponse = 14,
    NegotiationTimeoutWaitingForAccept = 15,
    IncomingConnectionIgnored = 16,
    SignalingParsingFailure = 17,
    SignalingUnknownError = 18,
    SignalingUnicastMessageDeliveryFailed = 19,
    SignalingBroadcastDeliveryFailed = 20,
    SignalingMessageDeliveryFailed = 21,
    SignalingTurnAuthFailed = 22,
    SignalingFallbackToBestEffortDelivery = 23,
    NoSignalingChannel = 24,
    NotLoggedIn = 25,
    SignalingFailedToSend = 26,
}

impl ErrorCode {
    /// Convert from the numeric wire value
    pub fn from_u32(value: u32) -> Option<Self> {
        let code = match value {
            0 => Self::None,
            1 => Self::DestinationNotLoggedIn,
            2 => Self::NegotiationTimeout,
            3 => Self::WrongTransportVersion,
            4 => Self::FailedToCreatePeerConnection,
            5 => Self::Ice,
            6 => Self::ConnectRequest,
            7 => Self::ConnectResponse,
            8 => Self::CandidateAdd,
            9 => Self::InactivityTimeout,
            10 => Self::FailedToCreateOffer,
            11 => Self::FailedToCreateAnswer,
            12 => Self::FailedToSetLocalDescription,
            13 => Self::FailedToSetRemoteDescription,
            14 => Self::NegotiationTimeoutWaitingForResponse,
            15 => Self::NegotiationTimeoutWaitingForAccept,
            16 => Self::IncomingConnectionIgnored,
            17 => Self::SignalingParsingFailure,
            18 => Self::SignalingUnknownError,
            19 => Self::SignalingUnicastMessageDeliveryFailed,
            20 => Self::SignalingBroadcastDeliveryFailed,
            21 => Self::SignalingMessageDeliveryFailed,
            22 => Self::SignalingTurnAuthFailed,
            23 => Self::SignalingFallbackToBestEffortDelivery,
            24 => Self::NoSignalingChannel,
            25 => Self::NotLoggedIn,
            26 => Self::SignalingFailedToSend,
            _ => return None,
        };
        Some(code)
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.as_u32())
    }
}

/// A signal exchanged between two peers
///
/// `network_id` is the remote peer: the sender for inbound signals and the
/// recipient for outbound ones. It travels in the signaling envelope, never
/// in the text form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    pub typ: SignalType,
    pub connection_id: ConnectionId,
    pub data: String,
    pub network_id: NetworkId,
}

impl Signal {
    pub fn new(
        typ: SignalType,
        connection_id: ConnectionId,
        data: impl Into<String>,
        network_id: NetworkId,
    ) -> Self {
        Self {
            typ,
            connection_id,
            data: data.into(),
            network_id,
        }
    }

    /// Build a `CONNECTERROR` signal carrying the decimal error code
    pub fn error(connection_id: ConnectionId, code: ErrorCode, network_id: NetworkId) -> Self {
        Self::new(
            SignalType::ConnectError,
            connection_id,
            code.as_u32().to_string(),
            network_id,
        )
    }

    /// Error code carried by a `CONNECTERROR` signal
    pub fn error_code(&self) -> Option<ErrorCode> {
        if self.typ != SignalType::ConnectError {
            return None;
        }
        self.data.trim().parse::<u32>().ok().and_then(ErrorCode::from_u32)
    }

    /// Encode to the three-field text record
    pub fn encode(&self) -> String {
        format!("{} {} {}", self.typ, self.connection_id, self.data)
    }

    /// Decode a text record. The network ID is supplied by the channel
    /// envelope the record arrived in.
    pub fn decode(record: &str, network_id: NetworkId) -> Result<Self, NetworkError> {
        let mut fields = record.splitn(3, ' ');
        let (Some(typ), Some(id), Some(data)) = (fields.next(), fields.next(), fields.next())
        else {
            return Err(NetworkError::InvalidSignal(format!(
                "expected 3 fields, got {:?}",
                record
            )));
        };

        let typ: SignalType = typ.parse()?;
        let connection_id = id.parse::<ConnectionId>().map_err(|e| {
            NetworkError::InvalidSignal(format!("invalid connection ID {:?}: {}", id, e))
        })?;

        Ok(Self {
            typ,
            connection_id,
            data: data.to_string(),
            network_id,
        })
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}
