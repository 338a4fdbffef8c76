//! nethernet - Peer-to-peer transport for Minecraft Bedrock Edition
//!
//! This library negotiates WebRTC data channels between Bedrock peers
//! through a relay or LAN signaling channel and exposes them as reliable
//! message streams.

pub mod config;
pub mod network;
pub mod protocol;
pub mod signaling;

pub use config::{DialConfig, LanConfig, ListenConfig, RelayConfig};
pub use network::{Conn, Dialer, Listener, NetworkError, WebRtcTransport};
pub use protocol::{NetworkId, Signal};
pub use signaling::{LanSignaling, MemoryNetwork, RelaySignaling, Signaling};
