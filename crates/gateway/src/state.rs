//! Shared state handed to every axum handler.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use wsrelay_config::Config;

use crate::registry::RoomDirectory;

pub struct GatewayState {
    pub rooms: RoomDirectory,
    pub config: Config,
    connections: AtomicUsize,
}

impl GatewayState {
    pub fn new(rooms: RoomDirectory, config: Config) -> Arc<Self> {
        Arc::new(Self { rooms, config, connections: AtomicUsize::new(0) })
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn connection_opened(&self) -> ConnectionGuard<'_> {
        self.connections.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard { state: self }
    }
}

/// Decrements the live connection count when the session that opened it ends,
/// regardless of which of `session::handle_connection`'s exit points it
/// takes.
pub struct ConnectionGuard<'a> {
    state: &'a GatewayState,
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        self.state.connections.fetch_sub(1, Ordering::Relaxed);
    }
}
