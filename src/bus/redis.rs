use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::AsyncCommands;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{error, info, warn};

use crate::bus::memory::InProcessBus;
use crate::bus::{EventBus, Topic};
use crate::error::{AppError, AppResult};
use crate::events::DomainEvent;

/// Multi-instance bus. Publishes serialized events to Redis channels and
/// mirrors everything received back into a local in-process registry, so
/// sessions on every instance see the same stream.
pub struct RedisBus {
    client: redis::Client,
    local: Arc<InProcessBus>,
}

impl RedisBus {
    pub fn new(redis_url: &str) -> AppResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| AppError::Bus(format!("invalid redis url: {e}")))?;
        Ok(Self {
            client,
            local: Arc::new(InProcessBus::new()),
        })
    }

    /// Pattern-subscribes to all topic channels and re-dispatches incoming
    /// events locally. Runs until the connection drops.
    pub async fn run_listener(&self) -> AppResult<()> {
        let conn = self
            .client
            .get_async_connection()
            .await
            .map_err(|e| AppError::Bus(format!("redis connect failed: {e}")))?;
        let mut pubsub = conn.into_pubsub();
        pubsub
            .psubscribe("conversation:*")
            .await
            .map_err(|e| AppError::Bus(format!("psubscribe failed: {e}")))?;
        pubsub
            .psubscribe("user:*")
            .await
            .map_err(|e| AppError::Bus(format!("psubscribe failed: {e}")))?;
        info!("redis listener subscribed to topic channels");

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let channel = msg.get_channel_name().to_string();
            let Some(topic) = Topic::parse(&channel) else {
                warn!(%channel, "ignoring message on unrecognized channel");
                continue;
            };
            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(%channel, "unreadable payload: {e}");
                    continue;
                }
            };
            match serde_json::from_str::<DomainEvent>(&payload) {
                Ok(event) => self.local.dispatch(topic, &event).await,
                Err(e) => warn!(%channel, "undecodable event: {e}"),
            }
        }

        error!("redis listener stream ended");
        Err(AppError::Bus("redis subscription closed".into()))
    }
}

#[async_trait]
impl EventBus for RedisBus {
    async fn publish(&self, topic: Topic, event: &DomainEvent) -> AppResult<()> {
        let payload = serde_json::to_string(event)
            .map_err(|e| AppError::Bus(format!("event serialization failed: {e}")))?;
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| AppError::Bus(format!("redis connect failed: {e}")))?;
        let _: i64 = conn
            .publish(topic.to_string(), payload)
            .await
            .map_err(|e| AppError::Bus(format!("redis publish failed: {e}")))?;
        Ok(())
    }

    async fn subscribe(&self, topic: Topic) -> UnboundedReceiver<DomainEvent> {
        self.local.register(topic).await
    }
}
