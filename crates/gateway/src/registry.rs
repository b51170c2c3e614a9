//! The global room directory: a lock-free map from room id to room actor,
//! created lazily on first join and torn down by the room actor itself once
//! empty (see `room::RoomActor::teardown`).

use std::sync::Arc;

use dashmap::DashMap;

use crate::{
    bridge::DistributionBridge,
    room::{self, RoomEntry, RoomMap},
};

#[derive(Clone)]
pub struct RoomDirectory {
    rooms: RoomMap,
    bridge: Arc<dyn DistributionBridge>,
    message_cache_cap: usize,
    disconnect_timeout: std::time::Duration,
}

impl RoomDirectory {
    pub fn new(
        bridge: Arc<dyn DistributionBridge>,
        message_cache_cap: usize,
        disconnect_timeout: std::time::Duration,
    ) -> Self {
        Self { rooms: Arc::new(DashMap::new()), bridge, message_cache_cap, disconnect_timeout }
    }

    /// Look up a room without creating one.
    pub fn get(&self, room_id: &str) -> Option<RoomEntry> {
        self.rooms.get(room_id).map(|entry| entry.clone())
    }

    /// Return the existing room, or spawn a fresh actor for it with
    /// `password_hash` fixed as its creation-time password. The hash is
    /// ignored on an existing room — rooms do not support changing or
    /// re-validating a password after creation.
    ///
    /// `DashMap::entry` holds the shard lock for `room_id` for the whole
    /// call, so two connections racing to create the same brand-new room
    /// can't each spawn their own actor and split the room in two — the
    /// second caller's closure never runs, and its `or_insert_with` just
    /// returns the first caller's entry.
    pub fn get_or_create(&self, room_id: &str, password_hash: Option<String>) -> RoomEntry {
        let bridge = Arc::clone(&self.bridge);
        let rooms = Arc::clone(&self.rooms);
        let message_cache_cap = self.message_cache_cap;
        let disconnect_timeout = self.disconnect_timeout;
        self.rooms
            .entry(room_id.to_string())
            .or_insert_with(|| {
                let handle = room::spawn(room_id.to_string(), bridge, rooms, message_cache_cap, disconnect_timeout);
                RoomEntry { handle, password_hash }
            })
            .clone()
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn room_ids(&self) -> Vec<String> {
        self.rooms.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Tell every live room's actor to close its sessions immediately,
    /// triggering no grace periods. Called once on process shutdown.
    pub fn shutdown_all(&self) {
        for entry in self.rooms.iter() {
            entry.value().handle.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::NoopBridge;

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let directory = RoomDirectory::new(Arc::new(NoopBridge), 8, std::time::Duration::from_secs(1));
        let first = directory.get_or_create("room-1", Some("hash".to_string()));
        let second = directory.get_or_create("room-1", None);
        assert_eq!(first.password_hash, second.password_hash);
        assert_eq!(directory.len(), 1);
    }

    #[tokio::test]
    async fn unknown_room_is_none_until_created() {
        let directory = RoomDirectory::new(Arc::new(NoopBridge), 8, std::time::Duration::from_secs(1));
        assert!(directory.get("nope").is_none());
        directory.get_or_create("nope", None);
        assert!(directory.get("nope").is_some());
    }
}
