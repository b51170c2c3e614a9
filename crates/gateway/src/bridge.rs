//! The distribution bridge: a publish/subscribe capability that lets rooms
//! span multiple server processes.
//!
//! The core router has no conditional awareness of distribution — it always
//! talks to a `dyn DistributionBridge`. When `REDIS_URL` is unset, or when
//! the initial connection attempt exhausts its retry budget, [`connect`]
//! hands back [`NoopBridge`] instead, and every publish/subscribe call is a
//! no-op from then on.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tracing::{error, info, warn};
use wsrelay_protocol::Signal;

use crate::room::RoomHandle;

const RETRY_BASE: Duration = Duration::from_millis(500);
const RETRY_INCREMENT: Duration = Duration::from_millis(500);
const MAX_ATTEMPTS: u32 = 5;

#[async_trait]
pub trait DistributionBridge: Send + Sync {
    /// Idempotent. `sink` receives re-injected signals for this room as they
    /// arrive on `room:{room_id}`.
    async fn subscribe(&self, room_id: &str, sink: RoomHandle);

    /// Idempotent.
    async fn unsubscribe(&self, room_id: &str);

    /// No-op unless `room_id` is currently subscribed.
    async fn publish(&self, room_id: &str, signal: &Signal);
}

/// Installed when no `REDIS_URL` is configured, or when the initial
/// connection attempt could not be established.
pub struct NoopBridge;

#[async_trait]
impl DistributionBridge for NoopBridge {
    async fn subscribe(&self, _room_id: &str, _sink: RoomHandle) {}
    async fn unsubscribe(&self, _room_id: &str) {}
    async fn publish(&self, _room_id: &str, _signal: &Signal) {}
}

/// Connect to the distribution backend, retrying with exponential backoff
/// (base 500ms, +500ms per attempt, up to 5 attempts) before degrading to
/// [`NoopBridge`].
pub async fn connect(redis_url: Option<&str>) -> Arc<dyn DistributionBridge> {
    let Some(url) = redis_url else {
        info!("no REDIS_URL configured, distribution bridge disabled");
        return Arc::new(NoopBridge);
    };

    let mut delay = RETRY_BASE;
    for attempt in 1..=MAX_ATTEMPTS {
        match redis_impl::RedisBridge::connect(url).await {
            Ok(bridge) => {
                info!(attempt, "distribution bridge connected");
                return Arc::new(bridge);
            },
            Err(e) => {
                warn!(attempt, error = %e, "distribution bridge connection attempt failed");
                if attempt == MAX_ATTEMPTS {
                    break;
                }
                tokio::time::sleep(delay).await;
                delay += RETRY_INCREMENT;
            },
        }
    }

    error!("distribution bridge exhausted retries, degrading to disabled");
    Arc::new(NoopBridge)
}

#[cfg(feature = "redis-bridge")]
mod redis_impl {
    use std::sync::Arc;

    use dashmap::DashMap;
    use futures::StreamExt;
    use redis::{AsyncCommands, aio::ConnectionManager};
    use tracing::{debug, warn};
    use wsrelay_protocol::Signal;

    use super::DistributionBridge;
    use crate::room::RoomHandle;

    enum PubSubCmd {
        Subscribe(String),
        Unsubscribe(String),
    }

    pub struct RedisBridge {
        publish_conn: ConnectionManager,
        sinks: Arc<DashMap<String, RoomHandle>>,
        cmd_tx: tokio::sync::mpsc::UnboundedSender<PubSubCmd>,
    }

    impl RedisBridge {
        pub async fn connect(url: &str) -> anyhow::Result<Self> {
            let client = redis::Client::open(url)?;
            let publish_conn = ConnectionManager::new(client.clone()).await?;

            let sinks: Arc<DashMap<String, RoomHandle>> = Arc::new(DashMap::new());
            let (cmd_tx, mut cmd_rx) = tokio::sync::mpsc::unbounded_channel::<PubSubCmd>();

            let pubsub_sinks = Arc::clone(&sinks);
            let mut pubsub = client.get_async_pubsub().await?;
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        cmd = cmd_rx.recv() => {
                            match cmd {
                                Some(PubSubCmd::Subscribe(room_id)) => {
                                    let channel = channel_name(&room_id);
                                    if let Err(e) = pubsub.subscribe(&channel).await {
                                        warn!(room_id, error = %e, "redis subscribe failed");
                                    }
                                },
                                Some(PubSubCmd::Unsubscribe(room_id)) => {
                                    let channel = channel_name(&room_id);
                                    if let Err(e) = pubsub.unsubscribe(&channel).await {
                                        warn!(room_id, error = %e, "redis unsubscribe failed");
                                    }
                                },
                                None => break,
                            }
                        }
                        msg = pubsub.on_message().next() => {
                            let Some(msg) = msg else { break };
                            let channel: String = msg.get_channel_name().to_string();
                            let Some(room_id) = room_id_from_channel(&channel) else { continue };
                            let Ok(payload) = msg.get_payload::<String>() else { continue };
                            let Ok(signal) = wsrelay_protocol::decode(&payload) else { continue };
                            if let Some(sink) = pubsub_sinks.get(room_id.as_str()) {
                                sink.bridge_inbound(signal);
                            }
                        }
                    }
                }
            });

            Ok(Self { publish_conn, sinks, cmd_tx })
        }
    }

    #[async_trait::async_trait]
    impl DistributionBridge for RedisBridge {
        async fn subscribe(&self, room_id: &str, sink: RoomHandle) {
            self.sinks.insert(room_id.to_string(), sink);
            let _ = self.cmd_tx.send(PubSubCmd::Subscribe(room_id.to_string()));
        }

        async fn unsubscribe(&self, room_id: &str) {
            self.sinks.remove(room_id);
            let _ = self.cmd_tx.send(PubSubCmd::Unsubscribe(room_id.to_string()));
        }

        async fn publish(&self, room_id: &str, signal: &Signal) {
            if !self.sinks.contains_key(room_id) {
                return;
            }
            let payload = wsrelay_protocol::encode(signal);
            let mut conn = self.publish_conn.clone();
            let channel = channel_name(room_id);
            if let Err(e) = conn.publish::<_, _, ()>(&channel, payload).await {
                warn!(room_id, error = %e, "redis publish failed");
            } else {
                debug!(room_id, "published signal to bridge");
            }
        }
    }

    fn channel_name(room_id: &str) -> String {
        format!("room:{room_id}")
    }

    fn room_id_from_channel(channel: &str) -> Option<String> {
        channel.strip_prefix("room:").map(str::to_string)
    }
}

#[cfg(not(feature = "redis-bridge"))]
mod redis_impl {
    pub struct RedisBridge;

    impl RedisBridge {
        pub async fn connect(_url: &str) -> anyhow::Result<Self> {
            anyhow::bail!("built without the redis-bridge feature")
        }
    }

    #[async_trait::async_trait]
    impl super::DistributionBridge for RedisBridge {
        async fn subscribe(&self, _room_id: &str, _sink: crate::room::RoomHandle) {}
        async fn unsubscribe(&self, _room_id: &str) {}
        async fn publish(&self, _room_id: &str, _signal: &wsrelay_protocol::Signal) {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_bridge_publish_is_inert() {
        let bridge = NoopBridge;
        bridge.publish("X", &Signal::Ping).await;
    }
}
