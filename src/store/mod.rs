pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::{
    Attachment, CallRecord, Conversation, ConversationSettings, Draft, EditRecord, Message,
    MessageKind, MessageMeta, Participant, Reaction, ReactionAction,
};

/// Payload for a message insert. The store assigns the id, timestamps and
/// the initial delivery status.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub kind: MessageKind,
    pub content: Option<String>,
    pub metadata: MessageMeta,
    pub attachments: Vec<Attachment>,
    pub reply_to_id: Option<i64>,
    pub forwarded_from_id: Option<i64>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Cursor pagination over a conversation's history. `before_id` walks
/// backwards from newer to older, `after_id` forwards.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageQuery {
    pub limit: i64,
    pub before_id: Option<i64>,
    pub after_id: Option<i64>,
}

/// Result of applying a batch of read receipts. `newly_read` holds only the
/// ids that this call actually marked, so repeated acks fan out nothing.
#[derive(Debug, Clone, Default)]
pub struct ReadOutcome {
    pub newly_read: Vec<i64>,
}

#[derive(Debug, Clone)]
pub struct ConversationSummary {
    pub conversation: Conversation,
    pub participant: Participant,
    pub unread_count: i64,
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn find_direct(&self, a: Uuid, b: Uuid) -> AppResult<Option<Conversation>>;

    async fn create_direct(
        &self,
        a: Uuid,
        b: Uuid,
        settings: ConversationSettings,
    ) -> AppResult<Conversation>;

    async fn create_group(
        &self,
        creator: Uuid,
        name: String,
        avatar_url: Option<String>,
        members: Vec<Uuid>,
        settings: ConversationSettings,
    ) -> AppResult<Conversation>;

    async fn conversation(&self, id: Uuid) -> AppResult<Option<Conversation>>;

    /// Marks the conversation encrypted and records the shared key reference.
    /// Once set, the flag and key reference never change.
    async fn set_encryption(
        &self,
        conversation_id: Uuid,
        key_reference: String,
    ) -> AppResult<Conversation>;

    async fn participant(&self, conversation_id: Uuid, user_id: Uuid)
        -> AppResult<Option<Participant>>;

    async fn active_participants(&self, conversation_id: Uuid) -> AppResult<Vec<Participant>>;

    /// Conversation ids the user is an active participant of.
    async fn active_conversation_ids(&self, user_id: Uuid) -> AppResult<Vec<Uuid>>;

    async fn list_conversations(
        &self,
        user_id: Uuid,
        include_archived: bool,
        limit: i64,
    ) -> AppResult<Vec<ConversationSummary>>;

    /// Inserts the message, bumps the conversation's last-message pointer and
    /// clears the sender's draft, all in one transaction.
    async fn append_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        new: NewMessage,
    ) -> AppResult<Message>;

    async fn message(&self, id: i64) -> AppResult<Option<Message>>;

    async fn list_messages(
        &self,
        conversation_id: Uuid,
        requester: Uuid,
        query: MessageQuery,
    ) -> AppResult<Vec<Message>>;

    /// Inserts receipts for the given ids, advances the reader's pointer to
    /// the highest id seen and upgrades message status where permitted.
    async fn apply_read_receipts(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        message_ids: &[i64],
    ) -> AppResult<ReadOutcome>;

    async fn delete_for_everyone(&self, message_id: i64) -> AppResult<Message>;

    async fn delete_for_user(&self, message_id: i64, user_id: Uuid) -> AppResult<()>;

    async fn apply_edit(
        &self,
        message_id: i64,
        new_content: String,
        prior: EditRecord,
    ) -> AppResult<Message>;

    async fn toggle_reaction(
        &self,
        message_id: i64,
        user_id: Uuid,
        symbol: &str,
    ) -> AppResult<ReactionAction>;

    async fn reactions(&self, message_id: i64) -> AppResult<Vec<Reaction>>;

    async fn save_draft(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        content: String,
        reply_to_id: Option<i64>,
    ) -> AppResult<Draft>;

    async fn draft(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<Option<Draft>>;

    async fn toggle_pin(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<Participant>;

    async fn toggle_mute(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        muted_until: Option<DateTime<Utc>>,
    ) -> AppResult<Participant>;

    async fn toggle_archive(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<Participant>;

    async fn insert_call(&self, call: CallRecord) -> AppResult<CallRecord>;

    async fn call(&self, id: i64) -> AppResult<Option<CallRecord>>;

    /// Persists the updated record. The write is guarded so an already ended
    /// call is never overwritten.
    async fn update_call(&self, call: &CallRecord) -> AppResult<()>;

    /// Tombstones every message whose expiry has passed. Returns tombstoned
    /// message ids grouped by conversation so callers can fan out deletions.
    async fn expire_messages(&self, now: DateTime<Utc>) -> AppResult<Vec<(Uuid, i64)>>;
}
