pub mod memory;
pub mod redis;

use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use crate::error::AppResult;
use crate::events::DomainEvent;

/// Routing key for event fan-out. Conversation topics reach every member's
/// session, user topics reach one user's sessions on every instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Conversation(Uuid),
    User(Uuid),
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Conversation(id) => write!(f, "conversation:{id}"),
            Topic::User(id) => write!(f, "user:{id}"),
        }
    }
}

impl Topic {
    pub fn parse(raw: &str) -> Option<Self> {
        let (prefix, id) = raw.split_once(':')?;
        let id = Uuid::parse_str(id).ok()?;
        match prefix {
            "conversation" => Some(Topic::Conversation(id)),
            "user" => Some(Topic::User(id)),
            _ => None,
        }
    }
}

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, topic: Topic, event: &DomainEvent) -> AppResult<()>;

    /// Registers a subscriber for the topic. The channel closes when the
    /// receiver is dropped; senders are pruned lazily on the next publish.
    async fn subscribe(&self, topic: Topic) -> UnboundedReceiver<DomainEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_render_and_parse() {
        let id = Uuid::new_v4();
        let topic = Topic::Conversation(id);
        assert_eq!(Topic::parse(&topic.to_string()), Some(topic));

        let topic = Topic::User(id);
        assert_eq!(Topic::parse(&topic.to_string()), Some(topic));
    }

    #[test]
    fn junk_channels_do_not_parse() {
        assert_eq!(Topic::parse("conversation:not-a-uuid"), None);
        assert_eq!(Topic::parse("presence:123"), None);
        assert_eq!(Topic::parse("no-separator"), None);
    }
}
