//! The liveness supervisor: a single periodic task that sweeps every room,
//! telling each room actor to probe (or close) its own members. There is no
//! per-client timer here — timeout detection happens inside the room actor,
//! which is the only task allowed to read a client's `last_pong`.

use std::time::Duration;

use tracing::debug;

use crate::registry::RoomDirectory;

/// Spawn the sweep loop. Runs until the process exits; call
/// [`tokio::task::JoinHandle::abort`] on shutdown if an earlier stop is
/// ever needed.
pub fn spawn(rooms: RoomDirectory, heartbeat_interval: Duration, pong_timeout: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat_interval);
        loop {
            ticker.tick().await;
            let room_ids = rooms.room_ids();
            debug!(rooms = room_ids.len(), "heartbeat sweep");
            for room_id in room_ids {
                if let Some(entry) = rooms.get(&room_id) {
                    entry.handle.heartbeat_sweep(pong_timeout);
                }
            }
        }
    })
}
