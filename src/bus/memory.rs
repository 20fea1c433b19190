use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::RwLock;

use crate::bus::{EventBus, Topic};
use crate::error::AppResult;
use crate::events::DomainEvent;

/// Single-instance bus: a registry of per-topic subscriber channels.
/// Doubles as the local delivery leg of the Redis-backed bus.
pub struct InProcessBus {
    topics: RwLock<HashMap<Topic, Vec<UnboundedSender<DomainEvent>>>>,
}

impl InProcessBus {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
        }
    }

    /// Delivers to local subscribers, dropping senders whose receiver has
    /// gone away.
    pub async fn dispatch(&self, topic: Topic, event: &DomainEvent) {
        let mut topics = self.topics.write().await;
        if let Some(senders) = topics.get_mut(&topic) {
            senders.retain(|sender| sender.send(event.clone()).is_ok());
            if senders.is_empty() {
                topics.remove(&topic);
            }
        }
    }

    pub async fn register(&self, topic: Topic) -> UnboundedReceiver<DomainEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics.write().await.entry(topic).or_default().push(tx);
        rx
    }
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InProcessBus {
    async fn publish(&self, topic: Topic, event: &DomainEvent) -> AppResult<()> {
        self.dispatch(topic, event).await;
        Ok(())
    }

    async fn subscribe(&self, topic: Topic) -> UnboundedReceiver<DomainEvent> {
        self.register(topic).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn typing_event(conversation_id: Uuid) -> DomainEvent {
        DomainEvent::TypingStatus {
            conversation_id,
            user_id: Uuid::new_v4(),
            is_typing: true,
        }
    }

    #[tokio::test]
    async fn subscribers_receive_their_topic_only() {
        let bus = InProcessBus::new();
        let conv_a = Uuid::new_v4();
        let conv_b = Uuid::new_v4();

        let mut rx_a = bus.subscribe(Topic::Conversation(conv_a)).await;
        let mut rx_b = bus.subscribe(Topic::Conversation(conv_b)).await;

        bus.publish(Topic::Conversation(conv_a), &typing_event(conv_a))
            .await
            .unwrap();

        let got = rx_a.recv().await.unwrap();
        assert_eq!(got.conversation_id(), conv_a);
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn every_subscriber_of_a_topic_gets_a_copy() {
        let bus = InProcessBus::new();
        let conv = Uuid::new_v4();

        let mut rx_1 = bus.subscribe(Topic::Conversation(conv)).await;
        let mut rx_2 = bus.subscribe(Topic::Conversation(conv)).await;

        bus.publish(Topic::Conversation(conv), &typing_event(conv))
            .await
            .unwrap();

        assert!(rx_1.recv().await.is_some());
        assert!(rx_2.recv().await.is_some());
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let bus = InProcessBus::new();
        let conv = Uuid::new_v4();

        let rx = bus.subscribe(Topic::Conversation(conv)).await;
        drop(rx);
        bus.publish(Topic::Conversation(conv), &typing_event(conv))
            .await
            .unwrap();

        assert!(bus.topics.read().await.is_empty());
    }
}
