//! A room: one actor task owning the membership map, reachable through a
//! cloneable [`RoomHandle`]. Every command lands on a single `mpsc` queue and
//! is processed strictly in order, which is what makes the state transitions
//! in this module race-free without a lock held across an `.await`.

use std::{collections::HashMap, sync::Arc, time::Instant};

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use wsrelay_protocol::{ClientDescriptor, MessagePayload, Signal};

use crate::{
    bridge::DistributionBridge,
    record::{ClientRecord, Outbound, SessionTx},
};

/// A room's entry in the global directory: a handle to its actor plus the
/// password hash fixed at creation. The hash never changes and is served to
/// every new connection before any command reaches the actor, so it lives
/// outside the actor's own state.
#[derive(Clone)]
pub struct RoomEntry {
    pub handle: RoomHandle,
    pub password_hash: Option<String>,
}

/// Shared directory storage. Lives in [`crate::registry`]; `room.rs` only
/// needs the map shape so a room actor can remove its own entry on empty
/// teardown without depending on the registry's higher-level API.
pub type RoomMap = Arc<DashMap<String, RoomEntry>>;

/// Commands a room actor consumes from its queue, one at a time.
pub enum RoomCommand {
    /// A peer on this server joined (or attempted to resume) the room.
    /// `reply` carries back the record's generation at the moment of
    /// binding, which the caller must echo on a later `SocketClosed` so a
    /// stale grace timer can recognize itself as superseded.
    Join { descriptor: ClientDescriptor, session: SessionTx, reply: oneshot::Sender<u64> },
    /// A peer on this server explicitly left.
    Leave { client_id: String },
    /// A peer on this server's write channel closed without an explicit
    /// leave (socket drop, network blip). Starts the grace-timeout window.
    SocketClosed { client_id: String, generation: u64 },
    /// The grace timer armed on a `SocketClosed` fired without a resuming
    /// join arriving first.
    GraceExpired { client_id: String, generation: u64 },
    /// A peer on this server replied to a liveness probe.
    Pong { client_id: String },
    /// A peer on this server sent an inbound ping; counts as a liveness
    /// touch same as a pong.
    ClientPing { client_id: String },
    /// A peer on this server wants to forward a point-to-point payload.
    Message { payload: MessagePayload },
    /// The liveness supervisor's periodic sweep reached this room.
    HeartbeatSweep { pong_timeout: std::time::Duration },
    /// A signal re-injected from another server process via the
    /// distribution bridge.
    BridgeInbound(Signal),
    /// The process is shutting down; close every local session immediately.
    Shutdown,
}

/// A cloneable, cheap-to-clone reference to a room's actor task.
#[derive(Clone)]
pub struct RoomHandle {
    room_id: String,
    tx: mpsc::UnboundedSender<RoomCommand>,
}

impl RoomHandle {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Join or resume. Resolves to the generation the record was bound at;
    /// pass it to [`RoomHandle::socket_closed`] when this session's socket
    /// eventually closes so a superseded binding can be told apart from the
    /// current one.
    pub async fn join(&self, descriptor: ClientDescriptor, session: SessionTx) -> u64 {
        let (reply, reply_rx) = oneshot::channel();
        let _ = self.tx.send(RoomCommand::Join { descriptor, session, reply });
        reply_rx.await.unwrap_or(0)
    }

    pub fn leave(&self, client_id: String) {
        let _ = self.tx.send(RoomCommand::Leave { client_id });
    }

    pub fn socket_closed(&self, client_id: String, generation: u64) {
        let _ = self.tx.send(RoomCommand::SocketClosed { client_id, generation });
    }

    pub fn grace_expired(&self, client_id: String, generation: u64) {
        let _ = self.tx.send(RoomCommand::GraceExpired { client_id, generation });
    }

    pub fn pong(&self, client_id: String) {
        let _ = self.tx.send(RoomCommand::Pong { client_id });
    }

    pub fn client_ping(&self, client_id: String) {
        let _ = self.tx.send(RoomCommand::ClientPing { client_id });
    }

    pub fn message(&self, payload: MessagePayload) {
        let _ = self.tx.send(RoomCommand::Message { payload });
    }

    pub fn heartbeat_sweep(&self, pong_timeout: std::time::Duration) {
        let _ = self.tx.send(RoomCommand::HeartbeatSweep { pong_timeout });
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(RoomCommand::Shutdown);
    }

    /// Re-inject a signal received from the distribution bridge. Called from
    /// the bridge's background pub/sub task, never from within this room's
    /// own actor — that's what makes it safe to call without `.await`.
    pub fn bridge_inbound(&self, signal: Signal) {
        let _ = self.tx.send(RoomCommand::BridgeInbound(signal));
    }
}

/// Spawn a room's actor task and return a handle to it. `room_map` is the
/// shared directory storage the actor removes its own entry from once the
/// last member leaves. Does not insert into `room_map` itself — the caller
/// (`registry::RoomDirectory::get_or_create`) owns that insert so it can do
/// it atomically against concurrent first-joins of the same room.
pub fn spawn(
    room_id: String,
    bridge: Arc<dyn DistributionBridge>,
    room_map: RoomMap,
    message_cache_cap: usize,
    disconnect_timeout: std::time::Duration,
) -> RoomHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = RoomHandle { room_id: room_id.clone(), tx };

    let bridge_for_subscribe = Arc::clone(&bridge);
    let handle_for_subscribe = handle.clone();
    let room_id_for_subscribe = room_id.clone();
    tokio::spawn(async move {
        bridge_for_subscribe.subscribe(&room_id_for_subscribe, handle_for_subscribe).await;
    });

    let actor = RoomActor {
        room_id,
        clients: HashMap::new(),
        bridge,
        room_map,
        message_cache_cap,
        disconnect_timeout,
        self_handle: handle.clone(),
        grace_timers: HashMap::new(),
    };
    tokio::spawn(actor.run(rx));

    handle
}

struct RoomActor {
    room_id: String,
    clients: HashMap<String, ClientRecord>,
    bridge: Arc<dyn DistributionBridge>,
    room_map: RoomMap,
    message_cache_cap: usize,
    disconnect_timeout: std::time::Duration,
    self_handle: RoomHandle,
    /// Pending grace-timeout sleeps, keyed by client id, so shutdown can
    /// abort them instead of leaving them as untracked fire-and-forget tasks.
    grace_timers: HashMap<String, tokio::task::JoinHandle<()>>,
}

impl RoomActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<RoomCommand>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                RoomCommand::Join { descriptor, session, reply } => {
                    self.handle_join(descriptor, session, reply).await
                },
                RoomCommand::Leave { client_id } => self.handle_leave(client_id).await,
                RoomCommand::SocketClosed { client_id, generation } => {
                    self.handle_socket_closed(client_id, generation)
                },
                RoomCommand::GraceExpired { client_id, generation } => {
                    self.handle_grace_expired(client_id, generation).await
                },
                RoomCommand::Pong { client_id } => self.touch_liveness(&client_id),
                RoomCommand::ClientPing { client_id } => self.touch_liveness(&client_id),
                RoomCommand::Message { payload } => self.handle_message(payload, true).await,
                RoomCommand::HeartbeatSweep { pong_timeout } => self.handle_heartbeat_sweep(pong_timeout),
                RoomCommand::BridgeInbound(signal) => self.handle_bridge_inbound(signal).await,
                RoomCommand::Shutdown => {
                    self.handle_shutdown();
                    break;
                },
            }
            if self.clients.is_empty() {
                self.teardown().await;
                break;
            }
        }
    }

    async fn handle_join(&mut self, descriptor: ClientDescriptor, session: SessionTx, reply: oneshot::Sender<u64>) {
        let client_id = descriptor.client_id.clone();

        let mut carried_generation = None;
        if let Some(existing) = self.clients.get_mut(&client_id) {
            if descriptor.is_resume() && !existing.is_open() {
                existing.rebind(session);
                existing.last_pong = Instant::now();
                let generation = existing.generation;
                debug!(room = %self.room_id, client_id, generation, "resumed within grace period");
                if let Some(timer) = self.grace_timers.remove(&client_id) {
                    timer.abort();
                }
                let _ = reply.send(generation);
                return;
            }
            // Either a fresh join with no resume flag, or a resume request
            // against a still-active record: evict the prior binding first,
            // fanning out its leave, then fall through to a fresh install.
            // Carry the old generation forward so a grace timer or heartbeat
            // close still in flight against the evicted incarnation can't
            // coincidentally match the fresh record's generation.
            carried_generation = Some(existing.generation);
            self.evict(&client_id, true).await;
        }

        for other in self.clients.values() {
            let _ = session.send(Outbound::Signal(Signal::Join(other.descriptor.clone())));
        }

        let mut record = ClientRecord::new(descriptor.clone(), session, self.message_cache_cap);
        if let Some(prior) = carried_generation {
            record.generation = prior + 1;
        }
        let generation = record.generation;
        self.clients.insert(client_id.clone(), record);

        self.broadcast_except(&client_id, Signal::Join(descriptor.clone()));
        self.bridge.publish(&self.room_id, &Signal::Join(descriptor)).await;
        let _ = reply.send(generation);
    }

    async fn handle_leave(&mut self, client_id: String) {
        if !self.clients.contains_key(&client_id) {
            warn!(room = %self.room_id, client_id, "leave from unknown client");
            return;
        }
        self.evict(&client_id, true).await;
    }

    /// A session's write loop ended without an explicit leave frame. Starts
    /// the grace-timeout window instead of evicting immediately, so a
    /// reconnect can resume the same identity.
    fn handle_socket_closed(&mut self, client_id: String, generation: u64) {
        let Some(record) = self.clients.get_mut(&client_id) else { return };
        if record.generation != generation {
            // Stale: the record has already moved on (rebind or re-evict).
            return;
        }
        record.session = None;
        debug!(room = %self.room_id, client_id, "entered grace-timeout window");

        let handle = self.self_handle.clone();
        let timeout = self.disconnect_timeout;
        let timer_client_id = client_id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            handle.grace_expired(timer_client_id, generation);
        });
        self.grace_timers.insert(client_id, timer);
    }

    async fn handle_grace_expired(&mut self, client_id: String, generation: u64) {
        self.grace_timers.remove(&client_id);
        let Some(record) = self.clients.get(&client_id) else { return };
        if record.generation != generation || record.is_open() {
            // Either superseded by a later binding, or resumed in the
            // meantime — this timer is stale.
            return;
        }
        info!(room = %self.room_id, client_id, "grace period expired, evicting");
        self.evict(&client_id, true).await;
    }

    fn touch_liveness(&mut self, client_id: &str) {
        if let Some(record) = self.clients.get_mut(client_id) {
            record.last_pong = Instant::now();
        }
    }

    async fn handle_message(&mut self, payload: MessagePayload, local: bool) {
        let target = payload.target_client_id.clone();
        match self.clients.get_mut(&target) {
            Some(record) => record.deliver(Signal::Message(payload)),
            None if local => {
                // Not ours; the peer may be connected to another instance,
                // so forward it rather than dropping it.
                debug!(room = %self.room_id, target, "target not local, publishing");
                self.bridge.publish(&self.room_id, &Signal::Message(payload)).await;
            },
            None => {},
        }
    }

    fn handle_heartbeat_sweep(&mut self, pong_timeout: std::time::Duration) {
        let now = Instant::now();
        for record in self.clients.values_mut() {
            if !record.is_open() {
                continue;
            }
            if now.duration_since(record.last_pong) > pong_timeout {
                info!(room = %self.room_id, client_id = %record.descriptor.client_id, "pong timeout, closing socket");
                record.request_close();
            } else {
                record.deliver(Signal::Ping);
            }
        }
    }

    async fn handle_bridge_inbound(&mut self, signal: Signal) {
        match signal {
            Signal::Join(descriptor) => {
                // A peer connected to another instance. Never install a
                // local record for it — only fan it out to local sessions.
                self.broadcast_all(Signal::Join(descriptor));
            },
            Signal::Leave(descriptor) => {
                self.broadcast_all(Signal::Leave(descriptor));
            },
            Signal::Message(payload) => {
                self.handle_message(payload, false).await;
            },
            Signal::Ping | Signal::Pong | Signal::Connected(_) => {},
        }
    }

    fn handle_shutdown(&mut self) {
        for (_, timer) in self.grace_timers.drain() {
            timer.abort();
        }
        for record in self.clients.values_mut() {
            record.request_close();
        }
    }

    /// Remove a client's record, optionally fanning out its leave and
    /// publishing it on the bridge. The connection's own read loop is
    /// responsible for closing its socket; dropping the record's sender here
    /// only tears down the server -> client push path.
    async fn evict(&mut self, client_id: &str, announce: bool) {
        if let Some(timer) = self.grace_timers.remove(client_id) {
            timer.abort();
        }
        let Some(record) = self.clients.remove(client_id) else { return };
        if announce {
            self.broadcast_all(Signal::Leave(record.descriptor.clone()));
            self.bridge.publish(&self.room_id, &Signal::Leave(record.descriptor)).await;
        }
    }

    fn broadcast_except(&mut self, except_client_id: &str, signal: Signal) {
        for (id, record) in self.clients.iter_mut() {
            if id != except_client_id {
                record.deliver(signal.clone());
            }
        }
    }

    fn broadcast_all(&mut self, signal: Signal) {
        for record in self.clients.values_mut() {
            record.deliver(signal.clone());
        }
    }

    async fn teardown(&mut self) {
        info!(room = %self.room_id, "room empty, tearing down");
        self.bridge.unsubscribe(&self.room_id).await;
        self.room_map.remove(&self.room_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::NoopBridge;
    use std::time::Duration;

    fn descriptor(id: &str, resume: Option<bool>) -> ClientDescriptor {
        ClientDescriptor { client_id: id.to_string(), name: id.to_string(), avatar: None, created_at: 1, resume }
    }

    fn spawn_test_room() -> (RoomHandle, RoomMap) {
        let map: RoomMap = Arc::new(DashMap::new());
        let handle = spawn("room-1".to_string(), Arc::new(NoopBridge), Arc::clone(&map), 8, Duration::from_millis(50));
        map.insert("room-1".to_string(), RoomEntry { handle: handle.clone(), password_hash: None });
        (handle, map)
    }

    #[tokio::test]
    async fn join_bootstraps_roster_and_fans_out() {
        let (room, _map) = spawn_test_room();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        room.join(descriptor("a", None), tx_a).await;
        let connected_a = tokio::time::timeout(Duration::from_millis(50), rx_a.recv()).await;
        // "a" is first in: no roster to bootstrap, no message yet.
        assert!(connected_a.is_err() || connected_a.unwrap().is_none());

        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        room.join(descriptor("b", None), tx_b).await;

        // "b" should see "a" in its bootstrap roster.
        let first = rx_b.recv().await.expect("roster bootstrap");
        assert!(matches!(first, Outbound::Signal(Signal::Join(d)) if d.client_id == "a"));

        // "a" should observe "b" joining.
        let observed = rx_a.recv().await.expect("fan-out to a");
        assert!(matches!(observed, Outbound::Signal(Signal::Join(d)) if d.client_id == "b"));
    }

    #[tokio::test]
    async fn leave_evicts_and_fans_out() {
        let (room, _map) = spawn_test_room();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        room.join(descriptor("a", None), tx_a).await;
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        room.join(descriptor("b", None), tx_b).await;
        let _ = rx_a.recv().await; // join(b) fan-out
        let _ = rx_b.recv().await; // roster bootstrap with a

        room.leave("b".to_string());
        let observed = rx_a.recv().await.expect("leave fan-out");
        assert!(matches!(observed, Outbound::Signal(Signal::Leave(d)) if d.client_id == "b"));
    }

    #[tokio::test]
    async fn room_tears_down_when_last_member_leaves() {
        let (room, map) = spawn_test_room();
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        room.join(descriptor("a", None), tx_a).await;
        room.leave("a".to_string());
        // Give the actor a chance to process and tear down.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!map.contains_key("room-1"));
    }

    #[tokio::test]
    async fn stale_grace_expiry_is_ignored_after_resume() {
        let (room, _map) = spawn_test_room();
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let generation = room.join(descriptor("a", None), tx_a).await;
        room.socket_closed("a".to_string(), generation);

        let (tx_a2, mut rx_a2) = mpsc::unbounded_channel();
        room.join(descriptor("a", Some(true)), tx_a2).await;

        // A grace timer armed against the pre-resume generation fires after
        // the resume bumped it; it must be a no-op.
        room.grace_expired("a".to_string(), generation);
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The resumed session should still be able to receive a broadcast.
        let (tx_b, _rx_b) = mpsc::unbounded_channel();
        room.join(descriptor("b", None), tx_b).await;
        let observed = rx_a2.recv().await.expect("a should still be in the room");
        assert!(matches!(observed, Outbound::Signal(Signal::Join(d)) if d.client_id == "b"));
    }

    #[tokio::test]
    async fn heartbeat_sweep_closes_sessions_past_pong_timeout() {
        let (room, _map) = spawn_test_room();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        room.join(descriptor("a", None), tx_a).await;

        // last_pong is effectively "now", so a zero timeout is immediately
        // exceeded without needing to sleep in the test.
        room.heartbeat_sweep(Duration::from_secs(0));

        let observed = rx_a.recv().await.expect("close instruction");
        assert!(matches!(observed, Outbound::Close));
    }

    #[tokio::test]
    async fn heartbeat_sweep_pings_sessions_within_timeout() {
        let (room, _map) = spawn_test_room();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        room.join(descriptor("a", None), tx_a).await;

        room.heartbeat_sweep(Duration::from_secs(60));

        let observed = rx_a.recv().await.expect("ping");
        assert!(matches!(observed, Outbound::Signal(Signal::Ping)));
    }
}
