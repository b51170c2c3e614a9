/// The relay's error taxonomy.
///
/// None of these are surfaced to peers as a structured error envelope — the
/// protocol has none. Per-frame variants are logged and recovered locally;
/// `ConfigInvalid` fails startup fast; `PubSubUnavailable` degrades the
/// distribution bridge to no-op for the process lifetime.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("unknown signal type: {0}")]
    UnknownSignalType(String),

    #[error("unknown room: {0}")]
    UnknownRoom(String),

    #[error("unknown client: {0}")]
    UnknownClient(String),

    #[error("session not open for client {0}")]
    SessionNotOpen(String),

    #[error("pub/sub bridge unavailable: {0}")]
    PubSubUnavailable(String),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
}
