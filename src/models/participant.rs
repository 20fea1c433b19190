use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Owner,
    Admin,
    Member,
}

impl ParticipantRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantRole::Owner => "owner",
            ParticipantRole::Admin => "admin",
            ParticipantRole::Member => "member",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "owner" => Some(ParticipantRole::Owner),
            "admin" => Some(ParticipantRole::Admin),
            "member" => Some(ParticipantRole::Member),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    Active,
    Left,
    Removed,
    Blocked,
}

impl ParticipantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantStatus::Active => "active",
            ParticipantStatus::Left => "left",
            ParticipantStatus::Removed => "removed",
            ParticipantStatus::Blocked => "blocked",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(ParticipantStatus::Active),
            "left" => Some(ParticipantStatus::Left),
            "removed" => Some(ParticipantStatus::Removed),
            "blocked" => Some(ParticipantStatus::Blocked),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub role: ParticipantRole,
    pub status: ParticipantStatus,
    pub last_read_message_id: Option<i64>,
    pub last_read_at: Option<DateTime<Utc>>,
    pub notifications_enabled: bool,
    pub is_muted: bool,
    pub muted_until: Option<DateTime<Utc>>,
    pub is_pinned: bool,
    pub pinned_at: Option<DateTime<Utc>>,
    pub is_archived: bool,
    pub archived_at: Option<DateTime<Utc>>,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
}

impl Participant {
    pub fn new(conversation_id: Uuid, user_id: Uuid, role: ParticipantRole) -> Self {
        Self {
            conversation_id,
            user_id,
            role,
            status: ParticipantStatus::Active,
            last_read_message_id: None,
            last_read_at: None,
            notifications_enabled: true,
            is_muted: false,
            muted_until: None,
            is_pinned: false,
            pinned_at: None,
            is_archived: false,
            archived_at: None,
            joined_at: Utc::now(),
            left_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == ParticipantStatus::Active
    }
}
