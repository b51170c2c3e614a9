//! The per-connection WebSocket handler: speaks the wire codec, drives one
//! room actor via commands, and owns the connection's own half of the
//! state machine (closing its socket is always this task's decision, never
//! something dictated back to it over the record's outbound channel —
//! except for a server-initiated close, which arrives as `Outbound::Close`).

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use wsrelay_protocol::{Signal, decode, encode};

use crate::{record::Outbound, state::GatewayState};

/// Drive one upgraded WebSocket connection into a room end to end.
pub async fn handle_connection(
    socket: WebSocket,
    state: Arc<GatewayState>,
    room_id: String,
    password_hash: Option<String>,
) {
    let _connection_guard = state.connection_opened();
    let rooms = state.rooms.clone();
    let conn_id = uuid::Uuid::new_v4().to_string();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (session_tx, mut session_rx) = mpsc::unbounded_channel::<Outbound>();

    let write_conn_id = conn_id.clone();
    let write_handle = tokio::spawn(async move {
        while let Some(event) = session_rx.recv().await {
            match event {
                Outbound::Signal(signal) => {
                    if ws_tx.send(Message::Text(encode(&signal).into())).await.is_err() {
                        debug!(conn_id = %write_conn_id, "write loop: send failed, closing");
                        break;
                    }
                },
                Outbound::Close => {
                    let _ = ws_tx.close().await;
                    break;
                },
            }
        }
    });

    let entry = rooms.get_or_create(&room_id, password_hash);
    let room = entry.handle;
    let _ = session_tx.send(Outbound::Signal(Signal::Connected(entry.password_hash)));

    let mut bound: Option<(String, u64)> = None;

    while let Some(msg) = ws_rx.next().await {
        let text = match msg {
            Ok(Message::Text(t)) => t.to_string(),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(conn_id = %conn_id, error = %e, "read error, closing");
                break;
            },
        };

        let signal = match decode(&text) {
            Ok(signal) => signal,
            Err(e) => {
                warn!(conn_id = %conn_id, room_id = %room_id, error = %e, "dropping malformed frame");
                continue;
            },
        };

        match signal {
            Signal::Join(descriptor) => {
                let client_id = descriptor.client_id.clone();
                let generation = room.join(descriptor, session_tx.clone()).await;
                bound = Some((client_id, generation));
            },
            Signal::Leave(_) => {
                if let Some((client_id, _)) = bound.take() {
                    room.leave(client_id);
                }
                break;
            },
            Signal::Message(payload) => {
                if bound.is_some() {
                    room.message(payload);
                } else {
                    warn!(conn_id = %conn_id, "message before join, dropping");
                }
            },
            Signal::Ping => {
                if let Some((client_id, _)) = &bound {
                    room.client_ping(client_id.clone());
                }
            },
            Signal::Pong => {
                if let Some((client_id, _)) = &bound {
                    room.pong(client_id.clone());
                }
            },
            Signal::Connected(_) => {
                warn!(conn_id = %conn_id, "client sent a server-only signal type, dropping");
            },
        }
    }

    if let Some((client_id, generation)) = bound {
        room.socket_closed(client_id, generation);
    }

    drop(session_tx);
    write_handle.abort();
    info!(conn_id = %conn_id, room_id = %room_id, "connection closed");
}
