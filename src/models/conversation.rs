use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::message::MessageKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Direct,
    Group,
}

impl ConversationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationKind::Direct => "direct",
            ConversationKind::Group => "group",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "direct" => Some(ConversationKind::Direct),
            "group" => Some(ConversationKind::Group),
            _ => None,
        }
    }
}

/// Per-conversation policy stored as JSONB alongside the row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSettings {
    pub allowed_kinds: Vec<MessageKind>,
    pub max_attachment_bytes: u64,
    pub max_members: usize,
}

impl Default for ConversationSettings {
    fn default() -> Self {
        Self {
            allowed_kinds: vec![
                MessageKind::Text,
                MessageKind::Image,
                MessageKind::Video,
                MessageKind::Audio,
                MessageKind::File,
                MessageKind::Location,
                MessageKind::Sticker,
                MessageKind::Gif,
            ],
            max_attachment_bytes: 64 * 1024 * 1024,
            max_members: 256,
        }
    }
}

impl ConversationSettings {
    pub fn allows(&self, kind: MessageKind) -> bool {
        self.allowed_kinds.contains(&kind)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub kind: ConversationKind,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
    pub created_by: Uuid,
    pub settings: ConversationSettings,
    pub is_encrypted: bool,
    /// Opaque reference to the shared key material held elsewhere.
    pub encryption_key: Option<String>,
    pub last_message_id: Option<i64>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Canonical key for a direct pair, identical regardless of argument order.
pub fn direct_key(a: Uuid, b: Uuid) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{lo}:{hi}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_key_is_order_independent() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(direct_key(a, b), direct_key(b, a));
    }

    #[test]
    fn default_settings_allow_all_kinds() {
        let settings = ConversationSettings::default();
        assert!(settings.allows(MessageKind::Text));
        assert!(settings.allows(MessageKind::Gif));
    }

    #[test]
    fn restricted_settings_reject_kind() {
        let settings = ConversationSettings {
            allowed_kinds: vec![MessageKind::Text],
            ..ConversationSettings::default()
        };
        assert!(!settings.allows(MessageKind::Video));
    }
}
