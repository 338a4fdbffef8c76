//! Network module for NetherNet peer connections
//!
//! Handles transport startup, listener and dialer negotiation, message
//! framing and session announcement.

mod announcer;
mod conn;
mod dialer;
mod error;
mod framing;
mod listener;
mod loopback;
mod rtc;
mod transport;

pub use announcer::{Announcer, Publisher, RoomStatus, RuntimeStatus};
pub use conn::{Addr, Conn, ConnState};
pub use dialer::Dialer;
pub use error::NetworkError;
pub use framing::{
    fragment, segment_count, Reassembler, ReassemblyError, MAX_MESSAGE_SIZE, MAX_SEGMENT_SIZE,
};
pub use listener::Listener;
pub use loopback::LoopbackTransport;
pub use rtc::WebRtcTransport;
pub use transport::{
    ChannelEvent, ChannelKind, DataChannel, DataChannels, LocalParameters, Role, Transport,
    TransportError, TransportStack, RELIABLE_CHANNEL, UNRELIABLE_CHANNEL,
};
