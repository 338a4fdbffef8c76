//! Ephemeral ICE server credentials issued by the signaling relay

use serde::{Deserialize, Serialize};

/// Credentials delivered in a relay type-3 envelope
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(rename = "ExpirationInSeconds")]
    pub expiration_in_seconds: u32,
    /// May be empty, in which case only host candidates are gathered
    #[serde(rename = "TurnAuthServers", default)]
    pub ice_servers: Vec<IceServer>,
}

/// A STUN or TURN server with its authentication parameters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    #[serde(rename = "Username", default)]
    pub username: String,
    #[serde(rename = "Password", default)]
    pub password: String,
    #[serde(rename = "Urls", default)]
    pub urls: Vec<String>,
}
