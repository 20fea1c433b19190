use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::models::{Attachment, CallKind, CallStatus, MessageKind, MessageMeta};

fn default_message_kind() -> MessageKind {
    MessageKind::Text
}

/// Frames a connected client may send. Unknown `type` tags fail to parse
/// and come back as an error frame.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    OpenDirect {
        peer_id: Uuid,
    },
    CreateGroup {
        name: String,
        #[serde(default)]
        avatar_url: Option<String>,
        #[serde(default)]
        member_ids: Vec<Uuid>,
    },
    SendMessage {
        conversation_id: Uuid,
        #[serde(default = "default_message_kind")]
        kind: MessageKind,
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        metadata: Option<MessageMeta>,
        #[serde(default)]
        attachments: Vec<Attachment>,
        #[serde(default)]
        reply_to_id: Option<i64>,
        #[serde(default)]
        forwarded_from_id: Option<i64>,
        #[serde(default)]
        expires_in_secs: Option<u64>,
    },
    MarkRead {
        conversation_id: Uuid,
        message_ids: Vec<i64>,
    },
    FetchMessages {
        conversation_id: Uuid,
        #[serde(default)]
        limit: Option<i64>,
        #[serde(default)]
        before_id: Option<i64>,
        #[serde(default)]
        after_id: Option<i64>,
    },
    ListConversations {
        #[serde(default)]
        include_archived: bool,
    },
    SetTyping {
        conversation_id: Uuid,
        is_typing: bool,
    },
    ToggleReaction {
        conversation_id: Uuid,
        message_id: i64,
        symbol: String,
    },
    DeleteMessage {
        conversation_id: Uuid,
        message_id: i64,
        #[serde(default)]
        for_everyone: bool,
    },
    EditMessage {
        conversation_id: Uuid,
        message_id: i64,
        content: String,
    },
    SaveDraft {
        conversation_id: Uuid,
        content: String,
        #[serde(default)]
        reply_to_id: Option<i64>,
    },
    FetchDraft {
        conversation_id: Uuid,
    },
    #[serde(rename = "pin")]
    TogglePin {
        conversation_id: Uuid,
    },
    #[serde(rename = "mute")]
    ToggleMute {
        conversation_id: Uuid,
        #[serde(default)]
        duration_hours: Option<i64>,
    },
    #[serde(rename = "archive")]
    ToggleArchive {
        conversation_id: Uuid,
    },
    StartCall {
        conversation_id: Uuid,
        kind: CallKind,
    },
    UpdateCallStatus {
        conversation_id: Uuid,
        call_id: i64,
        status: CallStatus,
    },
    Signal {
        conversation_id: Uuid,
        payload: Value,
    },
    /// Re-derives the session's topic subscriptions, picking up
    /// conversations joined after connect.
    Resubscribe,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_message_defaults_to_text() {
        let raw = format!(
            r#"{{"type":"send_message","conversation_id":"{}","content":"hi"}}"#,
            Uuid::new_v4()
        );
        let cmd: ClientCommand = serde_json::from_str(&raw).unwrap();
        match cmd {
            ClientCommand::SendMessage { kind, content, attachments, .. } => {
                assert_eq!(kind, MessageKind::Text);
                assert_eq!(content.as_deref(), Some("hi"));
                assert!(attachments.is_empty());
            }
            other => panic!("parsed wrong variant: {other:?}"),
        }
    }

    #[test]
    fn delete_defaults_to_delete_for_me() {
        let raw = format!(
            r#"{{"type":"delete_message","conversation_id":"{}","message_id":7}}"#,
            Uuid::new_v4()
        );
        let cmd: ClientCommand = serde_json::from_str(&raw).unwrap();
        match cmd {
            ClientCommand::DeleteMessage { for_everyone, .. } => assert!(!for_everyone),
            other => panic!("parsed wrong variant: {other:?}"),
        }
    }

    #[test]
    fn participant_flag_commands_use_short_names() {
        let raw = format!(r#"{{"type":"pin","conversation_id":"{}"}}"#, Uuid::new_v4());
        let cmd: ClientCommand = serde_json::from_str(&raw).unwrap();
        assert!(matches!(cmd, ClientCommand::TogglePin { .. }));

        let raw = format!(
            r#"{{"type":"mute","conversation_id":"{}","duration_hours":8}}"#,
            Uuid::new_v4()
        );
        let cmd: ClientCommand = serde_json::from_str(&raw).unwrap();
        assert!(matches!(
            cmd,
            ClientCommand::ToggleMute { duration_hours: Some(8), .. }
        ));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let raw = r#"{"type":"teleport","conversation_id":"x"}"#;
        assert!(serde_json::from_str::<ClientCommand>(raw).is_err());
    }
}
