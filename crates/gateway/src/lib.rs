//! Gateway: the room membership and routing engine.
//!
//! Lifecycle:
//! 1. Load + validate config
//! 2. Build the room directory and distribution bridge
//! 3. Start the HTTP/WebSocket server (`/health`, `/ws`)
//! 4. Start the liveness supervisor
//! 5. On interrupt, stop accepting, close sessions, drain timers, exit
//!
//! Each room is owned by a dedicated actor task (`room`) reachable through a
//! [`RoomHandle`](room::RoomHandle) held in the global [`RoomDirectory`](registry::RoomDirectory).
//! Connections are handled by `session`, which speaks the wire codec defined
//! in `wsrelay-protocol` and drives one room actor via commands.

pub mod bridge;
pub mod heartbeat;
pub mod record;
pub mod registry;
pub mod room;
pub mod server;
pub mod session;
pub mod state;
