use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Voice,
    Video,
}

impl CallKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallKind::Voice => "voice",
            CallKind::Video => "video",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "voice" => Some(CallKind::Voice),
            "video" => Some(CallKind::Video),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Initiated,
    Ringing,
    Answered,
    Declined,
    Missed,
    Ended,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Initiated => "initiated",
            CallStatus::Ringing => "ringing",
            CallStatus::Answered => "answered",
            CallStatus::Declined => "declined",
            CallStatus::Missed => "missed",
            CallStatus::Ended => "ended",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "initiated" => Some(CallStatus::Initiated),
            "ringing" => Some(CallStatus::Ringing),
            "answered" => Some(CallStatus::Answered),
            "declined" => Some(CallStatus::Declined),
            "missed" => Some(CallStatus::Missed),
            "ended" => Some(CallStatus::Ended),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CallStatus::Ended)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: i64,
    pub conversation_id: Uuid,
    pub caller_id: Uuid,
    pub kind: CallKind,
    pub status: CallStatus,
    pub started_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i32>,
    pub participants: Vec<Uuid>,
}

impl CallRecord {
    /// Applies a status update in place. Returns false when the call has
    /// already ended, which makes further updates a no-op.
    pub fn apply_status(
        &mut self,
        status: CallStatus,
        actor: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        match status {
            CallStatus::Answered => {
                if self.answered_at.is_none() {
                    self.answered_at = Some(now);
                }
                if let Some(user) = actor {
                    if !self.participants.contains(&user) {
                        self.participants.push(user);
                    }
                }
            }
            CallStatus::Ended | CallStatus::Declined | CallStatus::Missed => {
                self.ended_at = Some(now);
                if let Some(answered) = self.answered_at {
                    self.duration_seconds = Some((now - answered).num_seconds() as i32);
                }
            }
            CallStatus::Initiated | CallStatus::Ringing => {}
        }
        self.status = status;
        true
    }
}
