//! Configuration for signaling channels, listeners and dialers
//!
//! All structs deserialize with defaults for missing fields, so an embedder
//! can load them from whatever file format it already uses.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::network::NetworkError;
use crate::protocol::{ConnectionId, NetworkId};

/// Default interval between relay pings (seconds)
const DEFAULT_PING_INTERVAL_SECS: u64 = 15;

/// Default LAN discovery port
pub const DEFAULT_LAN_PORT: u16 = 7551;

/// Default interval between LAN discovery requests (milliseconds)
const DEFAULT_BROADCAST_INTERVAL_MS: u64 = 2000;

/// Default time a LAN peer address is kept without traffic (milliseconds)
const DEFAULT_ADDRESS_TTL_MS: u64 = 30_000;

/// Default time allowed for one negotiation (seconds)
const DEFAULT_NEGOTIATION_TIMEOUT_SECS: u64 = 15;

/// Relay WebSocket signaling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayConfig {
    /// Base URL of the signaling service, e.g. `wss://signal.example.net`
    pub url: String,

    /// Value of the `Authorization` header sent on the upgrade request
    #[serde(default)]
    pub token: String,

    /// Local Network ID (None = random)
    #[serde(default)]
    pub network_id: Option<NetworkId>,

    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
}

fn default_ping_interval_secs() -> u64 {
    DEFAULT_PING_INTERVAL_SECS
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            token: String::new(),
            network_id: None,
            ping_interval_secs: DEFAULT_PING_INTERVAL_SECS,
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<(), NetworkError> {
        if !self.url.starts_with("ws://") && !self.url.starts_with("wss://") {
            return Err(NetworkError::InvalidConfig(format!(
                "Invalid signaling URL: {}. Must start with ws:// or wss://",
                self.url
            )));
        }
        if self.ping_interval_secs == 0 {
            return Err(NetworkError::InvalidConfig(
                "ping_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
}

/// LAN broadcast discovery
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LanConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_lan_port")]
    pub port: u16,

    /// Destination of discovery requests (None = 255.255.255.255:port)
    #[serde(default)]
    pub broadcast_addr: Option<SocketAddr>,

    #[serde(default = "default_broadcast_interval_ms")]
    pub broadcast_interval_ms: u64,

    /// Local Network ID (None = random)
    #[serde(default)]
    pub network_id: Option<NetworkId>,

    /// IP of this host. Peers sending from it are answered through the
    /// broadcast address (None = detect the primary interface).
    #[serde(default)]
    pub local_ip: Option<IpAddr>,

    /// Peer addresses unheard from for this long are forgotten
    #[serde(default = "default_address_ttl_ms")]
    pub address_ttl_ms: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_lan_port() -> u16 {
    DEFAULT_LAN_PORT
}

fn default_broadcast_interval_ms() -> u64 {
    DEFAULT_BROADCAST_INTERVAL_MS
}

fn default_address_ttl_ms() -> u64 {
    DEFAULT_ADDRESS_TTL_MS
}

impl Default for LanConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            port: DEFAULT_LAN_PORT,
            broadcast_addr: None,
            broadcast_interval_ms: DEFAULT_BROADCAST_INTERVAL_MS,
            network_id: None,
            local_ip: None,
            address_ttl_ms: DEFAULT_ADDRESS_TTL_MS,
        }
    }
}

impl LanConfig {
    pub fn validate(&self) -> Result<(), NetworkError> {
        self.bind_socket_addr()?;
        if self.broadcast_interval_ms == 0 {
            return Err(NetworkError::InvalidConfig(
                "broadcast_interval_ms must be positive".to_string(),
            ));
        }
        if self.address_ttl_ms == 0 {
            return Err(NetworkError::InvalidConfig(
                "address_ttl_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Address the discovery socket binds to
    pub fn bind_socket_addr(&self) -> Result<SocketAddr, NetworkError> {
        let ip: IpAddr = self.bind_addr.parse().map_err(|e| {
            NetworkError::InvalidConfig(format!("Invalid bind address {}: {}", self.bind_addr, e))
        })?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn broadcast_socket_addr(&self) -> SocketAddr {
        self.broadcast_addr
            .unwrap_or_else(|| SocketAddr::from(([255, 255, 255, 255], self.port)))
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast_interval_ms)
    }

    pub fn address_ttl(&self) -> Duration {
        Duration::from_millis(self.address_ttl_ms)
    }
}

/// Listener settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListenConfig {
    /// Time allowed for an incoming negotiation to reach `Open`
    #[serde(default = "default_negotiation_timeout_secs")]
    pub negotiation_timeout_secs: u64,
}

fn default_negotiation_timeout_secs() -> u64 {
    DEFAULT_NEGOTIATION_TIMEOUT_SECS
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout_secs: DEFAULT_NEGOTIATION_TIMEOUT_SECS,
        }
    }
}

impl ListenConfig {
    pub fn validate(&self) -> Result<(), NetworkError> {
        if self.negotiation_timeout_secs == 0 {
            return Err(NetworkError::InvalidConfig(
                "negotiation_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs)
    }
}

/// Dialer settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DialConfig {
    #[serde(default = "default_negotiation_timeout_secs")]
    pub timeout_secs: u64,

    /// Fixed Connection ID for every dial (None = random per dial)
    #[serde(default)]
    pub connection_id: Option<ConnectionId>,
}

impl Default for DialConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_NEGOTIATION_TIMEOUT_SECS,
            connection_id: None,
        }
    }
}

impl DialConfig {
    pub fn validate(&self) -> Result<(), NetworkError> {
        if self.timeout_secs == 0 {
            return Err(NetworkError::InvalidConfig(
                "timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
