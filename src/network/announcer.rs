//! Session announcement
//!
//! Merges the static description of a hosted world with runtime values and
//! publishes the resulting session blob. Publication is skipped when the
//! document did not change since the last successful publish.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use super::error::NetworkError;
use crate::protocol::{
    BroadcastSetting, Connection, NetworkId, SessionInfo, TransportLayer,
};

/// Destination of session blobs: the LAN server data port or a presence
/// directory client
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, blob: Bytes) -> Result<(), NetworkError>;
}

/// Values that do not change while the world is hosted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomStatus {
    pub joinability: String,
    pub host_name: String,
    pub owner_id: String,
    pub version: String,
    pub level_id: String,
    pub world_name: String,
    pub world_type: String,
    pub protocol: i32,
    pub max_member_count: u32,
    pub broadcast_setting: BroadcastSetting,
    pub lan_game: bool,
    pub is_editor_world: bool,
    pub online_cross_platform_game: bool,
    pub cross_play_disabled: bool,
    pub title_id: i64,
}

impl Default for RoomStatus {
    fn default() -> Self {
        Self {
            joinability: "joinable_by_friends".to_string(),
            host_name: String::new(),
            owner_id: String::new(),
            version: String::new(),
            level_id: String::new(),
            world_name: String::new(),
            world_type: "Survival".to_string(),
            protocol: 0,
            max_member_count: 8,
            broadcast_setting: BroadcastSetting::FriendsOfFriends,
            lan_game: true,
            is_editor_world: false,
            online_cross_platform_game: true,
            cross_play_disabled: false,
            title_id: 0,
        }
    }
}

/// Values observed while hosting
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeStatus {
    pub member_count: u32,
    pub network_id: NetworkId,
    /// Set when a RakNet listener is co-hosted
    pub raknet_guid: Option<String>,
}

impl RoomStatus {
    /// Session document for the current runtime values
    pub fn session_info(&self, runtime: &RuntimeStatus) -> SessionInfo {
        let raknet_guid = runtime.raknet_guid.clone().unwrap_or_default();
        let mut connection = Connection::nethernet(runtime.network_id);
        connection.raknet_guid = raknet_guid.clone();

        SessionInfo {
            joinability: self.joinability.clone(),
            host_name: self.host_name.clone(),
            owner_id: self.owner_id.clone(),
            raknet_guid,
            version: self.version.clone(),
            level_id: self.level_id.clone(),
            world_name: self.world_name.clone(),
            world_type: self.world_type.clone(),
            protocol: self.protocol,
            member_count: runtime.member_count,
            max_member_count: self.max_member_count,
            broadcast_setting: self.broadcast_setting,
            lan_game: self.lan_game,
            is_editor_world: self.is_editor_world,
            transport_layer: TransportLayer::NetherNet,
            webrtc_network_id: runtime.network_id,
            online_cross_platform_game: self.online_cross_platform_game,
            cross_play_disabled: self.cross_play_disabled,
            title_id: self.title_id,
            supported_connections: vec![connection],
        }
    }
}

/// Publishes a room whenever its encoded document changes
pub struct Announcer<P> {
    publisher: P,
    room: RoomStatus,
    last: Mutex<Option<Vec<u8>>>,
}

impl<P: Publisher> Announcer<P> {
    pub fn new(publisher: P, room: RoomStatus) -> Self {
        Self {
            publisher,
            room,
            last: Mutex::new(None),
        }
    }

    pub fn room(&self) -> &RoomStatus {
        &self.room
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    /// Publish the document for `runtime`. Returns `false` when it is
    /// byte-identical to the previous publication.
    pub async fn announce(&self, runtime: &RuntimeStatus) -> Result<bool, NetworkError> {
        let blob = self.room.session_info(runtime).to_bytes()?;

        let mut last = self.last.lock().await;
        if last.as_deref() == Some(blob.as_slice()) {
            return Ok(false);
        }

        self.publisher.publish(Bytes::from(blob.clone())).await?;
        debug!(
            "Announced {} ({} of {} members)",
            self.room.world_name, runtime.member_count, self.room.max_member_count
        );
        *last = Some(blob);
        Ok(true)
    }
}
