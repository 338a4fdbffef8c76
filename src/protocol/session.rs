//! Session blob advertising how to reach a host
//!
//! The same JSON document is published to presence directories and embedded
//! in LAN discovery responses. Field names are case-sensitive.

use serde::{Deserialize, Serialize};

use crate::protocol::NetworkId;

/// Who may see the session in their friends list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum BroadcastSetting {
    InviteOnly = 1,
    #[default]
    FriendsOnly = 2,
    FriendsOfFriends = 3,
}

impl From<BroadcastSetting> for u8 {
    fn from(value: BroadcastSetting) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for BroadcastSetting {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::InviteOnly),
            2 => Ok(Self::FriendsOnly),
            3 => Ok(Self::FriendsOfFriends),
            other => Err(format!("invalid BroadcastSetting {}", other)),
        }
    }
}

/// Transport a host serves on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum TransportLayer {
    RakNet = 0,
    #[default]
    NetherNet = 2,
}

impl From<TransportLayer> for u8 {
    fn from(value: TransportLayer) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for TransportLayer {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::RakNet),
            2 => Ok(Self::NetherNet),
            other => Err(format!("invalid TransportLayer {}", other)),
        }
    }
}

/// Kind of an entry in `SupportedConnections`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum ConnectionType {
    WebSocketsWebRtcSignaling = 3,
    UPnP = 6,
}

impl From<ConnectionType> for u8 {
    fn from(value: ConnectionType) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for ConnectionType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            3 => Ok(Self::WebSocketsWebRtcSignaling),
            6 => Ok(Self::UPnP),
            other => Err(format!("invalid ConnectionType {}", other)),
        }
    }
}

/// One way of reaching the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    #[serde(rename = "ConnectionType")]
    pub connection_type: ConnectionType,
    #[serde(rename = "HostIpAddress", default)]
    pub host_ip_address: String,
    #[serde(rename = "HostPort", default)]
    pub host_port: u16,
    #[serde(rename = "NetherNetId", default)]
    pub nethernet_id: NetworkId,
    #[serde(rename = "WebRTCNetworkId", default)]
    pub webrtc_network_id: NetworkId,
    #[serde(rename = "RakNetGUID", default)]
    pub raknet_guid: String,
}

impl Connection {
    /// Entry for a NetherNet host reachable through WebSocket signaling
    pub fn nethernet(network_id: NetworkId) -> Self {
        Self {
            connection_type: ConnectionType::WebSocketsWebRtcSignaling,
            host_ip_address: String::new(),
            host_port: 0,
            nethernet_id: network_id,
            webrtc_network_id: network_id,
            raknet_guid: String::new(),
        }
    }
}

/// The full session document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    #[serde(rename = "Joinability")]
    pub joinability: String,
    #[serde(rename = "hostName")]
    pub host_name: String,
    #[serde(rename = "ownerId")]
    pub owner_id: String,
    #[serde(rename = "rakNetGUID", default)]
    pub raknet_guid: String,
    #[serde(rename = "version")]
    pub version: String,
    #[serde(rename = "levelId")]
    pub level_id: String,
    #[serde(rename = "worldName")]
    pub world_name: String,
    #[serde(rename = "worldType")]
    pub world_type: String,
    #[serde(rename = "protocol")]
    pub protocol: i32,
    #[serde(rename = "MemberCount")]
    pub member_count: u32,
    #[serde(rename = "MaxMemberCount")]
    pub max_member_count: u32,
    #[serde(rename = "BroadcastSetting")]
    pub broadcast_setting: BroadcastSetting,
    #[serde(rename = "LanGame")]
    pub lan_game: bool,
    #[serde(rename = "isEditorWorld")]
    pub is_editor_world: bool,
    #[serde(rename = "TransportLayer")]
    pub transport_layer: TransportLayer,
    #[serde(rename = "WebRTCNetworkId")]
    pub webrtc_network_id: NetworkId,
    #[serde(rename = "OnlineCrossPlatformGame")]
    pub online_cross_platform_game: bool,
    #[serde(rename = "CrossPlayDisabled")]
    pub cross_play_disabled: bool,
    #[serde(rename = "TitleId")]
    pub title_id: i64,
    #[serde(rename = "SupportedConnections", default)]
    pub supported_connections: Vec<Connection>,
}

impl SessionInfo {
    /// Encode as the opaque byte string carried by presence and LAN
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}
