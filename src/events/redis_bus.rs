//! Redis-backed event bus.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tracing::{debug, error};

use super::{session_channel_key, Event, EventBus};

/// Publish/subscribe over redis channels, one channel per session.
#[derive(Clone)]
pub struct RedisBus {
    client: redis::Client,
    publisher: ConnectionManager,
}

impl RedisBus {
    pub fn new(client: redis::Client, publisher: ConnectionManager) -> Self {
        Self { client, publisher }
    }
}

#[async_trait]
impl EventBus for RedisBus {
    async fn publish(&self, session_id: &str, event: Event) -> Result<()> {
        let channel = session_channel_key(session_id);
        let data = serde_json::to_string(&event).context("marshalling event")?;
        let mut conn = self.publisher.clone();
        let _: i64 = conn
            .publish(&channel, data)
            .await
            .with_context(|| format!("publishing to {channel}"))?;
        Ok(())
    }

    async fn subscribe(&self, session_id: &str) -> Result<mpsc::Receiver<Event>> {
        let channel = session_channel_key(session_id);
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .context("opening pubsub connection")?;
        pubsub
            .subscribe(&channel)
            .await
            .with_context(|| format!("subscribing to {channel}"))?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut messages = pubsub.on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        error!(%err, "failed to read pubsub payload");
                        continue;
                    }
                };
                let event: Event = match serde_json::from_str(&payload) {
                    Ok(event) => event,
                    Err(err) => {
                        error!(%err, "failed to unmarshal event");
                        continue;
                    }
                };
                if tx.send(event).await.is_err() {
                    // Subscriber went away; dropping the pubsub connection
                    // unsubscribes.
                    break;
                }
            }
            debug!(channel, "pubsub subscription closed");
        });

        Ok(rx)
    }
}
