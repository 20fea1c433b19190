use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Video,
    Audio,
    File,
    Location,
    Sticker,
    Gif,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::Video => "video",
            MessageKind::Audio => "audio",
            MessageKind::File => "file",
            MessageKind::Location => "location",
            MessageKind::Sticker => "sticker",
            MessageKind::Gif => "gif",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "text" => Some(MessageKind::Text),
            "image" => Some(MessageKind::Image),
            "video" => Some(MessageKind::Video),
            "audio" => Some(MessageKind::Audio),
            "file" => Some(MessageKind::File),
            "location" => Some(MessageKind::Location),
            "sticker" => Some(MessageKind::Sticker),
            "gif" => Some(MessageKind::Gif),
            _ => None,
        }
    }

    /// Kinds whose payload lives in attachments rather than content.
    pub fn requires_attachment(&self) -> bool {
        matches!(
            self,
            MessageKind::Image
                | MessageKind::Video
                | MessageKind::Audio
                | MessageKind::File
                | MessageKind::Gif
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Sending => "sending",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
            MessageStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "sending" => Some(MessageStatus::Sending),
            "sent" => Some(MessageStatus::Sent),
            "delivered" => Some(MessageStatus::Delivered),
            "read" => Some(MessageStatus::Read),
            "failed" => Some(MessageStatus::Failed),
            _ => None,
        }
    }

    /// Read and Failed are terminal. A receipt may jump sent straight to read.
    pub fn can_transition(self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        matches!(
            (self, next),
            (Sending, Sent) | (Sending, Failed) | (Sent, Delivered) | (Sent, Read) | (Delivered, Read)
        )
    }
}

/// Kind-specific payload stored alongside the message row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageMeta {
    None,
    Image { width: u32, height: u32 },
    Video { width: u32, height: u32, duration_ms: u64 },
    Audio { duration_ms: u64 },
    File { file_name: String, size_bytes: u64 },
    Location { lat: f64, lng: f64 },
    Sticker { pack: String, name: String },
    Gif { source_url: String },
}

impl Default for MessageMeta {
    fn default() -> Self {
        MessageMeta::None
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub mime: String,
    pub size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

/// Snapshot of the content a message held before an edit replaced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditRecord {
    pub content: Option<String>,
    pub edited_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub kind: MessageKind,
    pub content: Option<String>,
    pub metadata: MessageMeta,
    pub attachments: Vec<Attachment>,
    pub reply_to_id: Option<i64>,
    pub forwarded_from_id: Option<i64>,
    pub is_edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub edit_history: Vec<EditRecord>,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub deleted_for: Vec<Uuid>,
    pub status: MessageStatus,
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Message {
    /// Blanks out content while keeping the row visible as a tombstone.
    pub fn tombstone(&mut self, now: DateTime<Utc>) {
        self.content = None;
        self.attachments.clear();
        self.metadata = MessageMeta::None;
        self.is_deleted = true;
        self.deleted_at = Some(now);
    }

    pub fn hidden_for(&self, user_id: Uuid) -> bool {
        self.deleted_for.contains(&user_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reaction {
    pub message_id: i64,
    pub user_id: Uuid,
    pub symbol: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactionAction {
    Added,
    Removed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_follow_the_ladder() {
        use MessageStatus::*;
        assert!(Sending.can_transition(Sent));
        assert!(Sending.can_transition(Failed));
        assert!(Sent.can_transition(Delivered));
        assert!(Sent.can_transition(Read));
        assert!(Delivered.can_transition(Read));
    }

    #[test]
    fn terminal_statuses_stay_put() {
        use MessageStatus::*;
        assert!(!Read.can_transition(Delivered));
        assert!(!Read.can_transition(Sent));
        assert!(!Failed.can_transition(Sent));
        assert!(!Delivered.can_transition(Sent));
    }

    #[test]
    fn tombstone_blanks_payload_but_keeps_row() {
        let now = Utc::now();
        let mut msg = Message {
            id: 1,
            conversation_id: Uuid::new_v4(),
            sender_id: Uuid::new_v4(),
            kind: MessageKind::Text,
            content: Some("hello".into()),
            metadata: MessageMeta::None,
            attachments: vec![Attachment {
                url: "https://cdn.example/a.png".into(),
                mime: "image/png".into(),
                size_bytes: 10,
                width: None,
                height: None,
            }],
            reply_to_id: None,
            forwarded_from_id: None,
            is_edited: false,
            edited_at: None,
            edit_history: vec![],
            is_deleted: false,
            deleted_at: None,
            deleted_for: vec![],
            status: MessageStatus::Sent,
            delivered_at: None,
            created_at: now,
            expires_at: None,
        };
        msg.tombstone(now);
        assert!(msg.is_deleted);
        assert!(msg.content.is_none());
        assert!(msg.attachments.is_empty());
        assert_eq!(msg.deleted_at, Some(now));
    }

    #[test]
    fn metadata_serializes_with_kind_tag() {
        let meta = MessageMeta::Audio { duration_ms: 1500 };
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["kind"], "audio");
        assert_eq!(json["duration_ms"], 1500);
    }
}
