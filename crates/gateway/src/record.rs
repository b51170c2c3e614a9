//! The per-client record held inside a room actor.

use std::{collections::VecDeque, time::Instant};

use tokio::sync::mpsc;
use wsrelay_protocol::{ClientDescriptor, Signal};

/// What a room actor pushes down a session's write loop: either a wire
/// signal, or an instruction to close the socket outright (the heartbeat
/// supervisor has no other way to reach a connection blocked on its read
/// loop).
#[derive(Debug, Clone)]
pub enum Outbound {
    Signal(Signal),
    Close,
}

/// Outbound channel to a session's write loop. A closed channel (send
/// failure) is this crate's definition of "session not open" — there is no
/// separate `readyState` query to poll.
pub type SessionTx = mpsc::UnboundedSender<Outbound>;

/// One client's state within a room.
///
/// `session` is `None` while the record is in the grace-timeout window
/// (connection closed, no resuming join yet). `generation` is bumped on every
/// rebind or eviction so that a grace timer or heartbeat-close scheduled
/// against a stale binding is a no-op when it eventually fires — see
/// `room::RoomActor` for the idempotency check.
pub struct ClientRecord {
    pub descriptor: ClientDescriptor,
    pub session: Option<SessionTx>,
    pub last_pong: Instant,
    pub generation: u64,
    message_cache: VecDeque<Signal>,
    cache_cap: usize,
}

impl ClientRecord {
    pub fn new(descriptor: ClientDescriptor, session: SessionTx, cache_cap: usize) -> Self {
        Self {
            descriptor,
            session: Some(session),
            last_pong: Instant::now(),
            generation: 0,
            message_cache: VecDeque::new(),
            cache_cap,
        }
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    /// Deliver a signal: write to the open session, or append to the cache
    /// (oldest-drop once `cache_cap` is reached) when the session is closed.
    /// `ping` envelopes are never cached — the heartbeat supervisor only
    /// cares about the next liveness cycle, not catching up a reconnected peer.
    pub fn deliver(&mut self, signal: Signal) {
        if let Some(tx) = &self.session {
            if tx.send(Outbound::Signal(signal.clone())).is_ok() {
                return;
            }
            // Write-loop task has gone away; treat as closed from here on.
            self.session = None;
        }
        if matches!(signal, Signal::Ping) {
            return;
        }
        if self.message_cache.len() >= self.cache_cap {
            self.message_cache.pop_front();
        }
        self.message_cache.push_back(signal);
    }

    /// Tell an open session's write loop to close the socket. A no-op if the
    /// record is already closed.
    pub fn request_close(&mut self) {
        if let Some(tx) = &self.session {
            if tx.send(Outbound::Close).is_err() {
                self.session = None;
            }
        }
    }

    /// Rebind an existing record to a fresh session on resume, flushing any
    /// cached envelopes to it in FIFO order before any subsequent delivery.
    pub fn rebind(&mut self, session: SessionTx) {
        self.generation += 1;
        for queued in self.message_cache.drain(..) {
            let _ = session.send(Outbound::Signal(queued));
        }
        self.session = Some(session);
    }

    pub fn cached_len(&self) -> usize {
        self.message_cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: &str) -> ClientDescriptor {
        ClientDescriptor {
            client_id: id.to_string(),
            name: id.to_string(),
            avatar: None,
            created_at: 1,
            resume: None,
        }
    }

    #[test]
    fn caches_when_closed_and_drops_oldest_over_cap() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx); // closed from the start
        let mut record = ClientRecord::new(descriptor("a"), tx, 2);
        record.deliver(Signal::Leave(descriptor("x")));
        record.deliver(Signal::Leave(descriptor("y")));
        record.deliver(Signal::Leave(descriptor("z")));
        assert_eq!(record.cached_len(), 2);
    }

    #[test]
    fn ping_is_dropped_not_cached_when_closed() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let mut record = ClientRecord::new(descriptor("a"), tx, 8);
        record.deliver(Signal::Ping);
        assert_eq!(record.cached_len(), 0);
    }

    #[test]
    fn rebind_flushes_cache_in_order() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let mut record = ClientRecord::new(descriptor("a"), tx, 8);
        record.deliver(Signal::Leave(descriptor("x")));
        record.deliver(Signal::Leave(descriptor("y")));

        let (tx2, mut rx2) = mpsc::unbounded_channel();
        record.rebind(tx2);
        assert_eq!(record.cached_len(), 0);
        let first = rx2.try_recv().expect("first cached signal");
        let second = rx2.try_recv().expect("second cached signal");
        assert!(matches!(first, Outbound::Signal(Signal::Leave(d)) if d.client_id == "x"));
        assert!(matches!(second, Outbound::Signal(Signal::Leave(d)) if d.client_id == "y"));
    }
}
