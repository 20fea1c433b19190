use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::{CallRecord, CallStatus, Message, ReactionAction};

/// Everything that fans out to connected sessions, across instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    NewMessage {
        conversation_id: Uuid,
        message: Message,
    },
    MessageEdited {
        conversation_id: Uuid,
        message_id: i64,
        new_content: String,
        edited_by: Uuid,
        edited_at: DateTime<Utc>,
    },
    MessageDeleted {
        conversation_id: Uuid,
        message_id: i64,
        deleted_by: Uuid,
        for_everyone: bool,
    },
    TypingStatus {
        conversation_id: Uuid,
        user_id: Uuid,
        is_typing: bool,
    },
    MessagesRead {
        conversation_id: Uuid,
        user_id: Uuid,
        message_ids: Vec<i64>,
    },
    ReactionUpdate {
        conversation_id: Uuid,
        message_id: i64,
        user_id: Uuid,
        symbol: String,
        action: ReactionAction,
    },
    IncomingCall {
        conversation_id: Uuid,
        call: CallRecord,
        caller: Uuid,
    },
    CallStatusUpdate {
        conversation_id: Uuid,
        call_id: i64,
        status: CallStatus,
        actor: Option<Uuid>,
    },
    /// Opaque signalling payload relayed between call peers. The engine
    /// never inspects the body.
    Signal {
        conversation_id: Uuid,
        from: Uuid,
        payload: Value,
    },
}

impl DomainEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::NewMessage { .. } => "new_message",
            DomainEvent::MessageEdited { .. } => "message_edited",
            DomainEvent::MessageDeleted { .. } => "message_deleted",
            DomainEvent::TypingStatus { .. } => "typing_status",
            DomainEvent::MessagesRead { .. } => "messages_read",
            DomainEvent::ReactionUpdate { .. } => "reaction_update",
            DomainEvent::IncomingCall { .. } => "incoming_call",
            DomainEvent::CallStatusUpdate { .. } => "call_status_update",
            DomainEvent::Signal { .. } => "signal",
        }
    }

    pub fn conversation_id(&self) -> Uuid {
        match self {
            DomainEvent::NewMessage { conversation_id, .. }
            | DomainEvent::MessageEdited { conversation_id, .. }
            | DomainEvent::MessageDeleted { conversation_id, .. }
            | DomainEvent::TypingStatus { conversation_id, .. }
            | DomainEvent::MessagesRead { conversation_id, .. }
            | DomainEvent::ReactionUpdate { conversation_id, .. }
            | DomainEvent::IncomingCall { conversation_id, .. }
            | DomainEvent::CallStatusUpdate { conversation_id, .. }
            | DomainEvent::Signal { conversation_id, .. } => *conversation_id,
        }
    }

    /// Flat wire frame: the tagged fields plus a server-side timestamp.
    pub fn to_broadcast_payload(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(ref mut map) = value {
            map.insert(
                "timestamp".to_string(),
                Value::String(Utc::now().to_rfc3339()),
            );
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_carries_type_tag_and_timestamp() {
        let event = DomainEvent::TypingStatus {
            conversation_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            is_typing: true,
        };
        let payload = event.to_broadcast_payload();
        assert_eq!(payload["type"], "typing_status");
        assert_eq!(payload["is_typing"], true);
        assert!(payload["timestamp"].is_string());
    }

    #[test]
    fn events_round_trip_through_json() {
        let event = DomainEvent::MessagesRead {
            conversation_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            message_ids: vec![3, 5, 8],
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: DomainEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event_type(), "messages_read");
        assert_eq!(back.conversation_id(), event.conversation_id());
    }
}
