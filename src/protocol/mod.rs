//! Wire formats used by the NetherNet control plane
//!
//! Signals, SDP descriptions, ICE candidate records, relay credentials and
//! the session advertisement blob.

mod candidate;
mod credentials;
mod sdp;
mod session;
mod signal;

pub use candidate::{CandidateType, IceCandidate};
pub use credentials::{Credentials, IceServer};
pub use sdp::{Fingerprint, SessionDescription, Setup, DEFAULT_MAX_MESSAGE_SIZE, SCTP_PORT};
pub use session::{BroadcastSetting, Connection, ConnectionType, SessionInfo, TransportLayer};
pub use signal::{ConnectionId, ErrorCode, NetworkId, Signal, SignalType};
