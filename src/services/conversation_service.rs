use std::sync::Arc;

use chrono::{Duration, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bus::{EventBus, Topic};
use crate::cache::TypingCache;
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::events::DomainEvent;
use crate::models::{
    Attachment, CallKind, CallRecord, CallStatus, Conversation, ConversationSettings, Draft,
    EditRecord, Message, MessageKind, MessageMeta, Participant, Reaction,
};
use crate::store::{ConversationStore, ConversationSummary, MessageQuery, NewMessage};

/// Tunables lifted out of the full config so tests can build a service
/// without one.
#[derive(Debug, Clone)]
pub struct ServiceLimits {
    pub delete_window_hours: i64,
    pub max_group_members: usize,
    pub page_limit: i64,
}

impl ServiceLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            delete_window_hours: config.delete_window_hours,
            max_group_members: config.max_group_members,
            page_limit: config.page_limit,
        }
    }
}

impl Default for ServiceLimits {
    fn default() -> Self {
        Self {
            delete_window_hours: 24,
            max_group_members: 256,
            page_limit: 50,
        }
    }
}

/// Client-supplied message payload, before the store assigns identity.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub kind: MessageKind,
    pub content: Option<String>,
    pub metadata: MessageMeta,
    pub attachments: Vec<Attachment>,
    pub reply_to_id: Option<i64>,
    pub forwarded_from_id: Option<i64>,
    pub expires_in_secs: Option<u64>,
}

pub struct ConversationService {
    store: Arc<dyn ConversationStore>,
    bus: Arc<dyn EventBus>,
    typing: Arc<TypingCache>,
    limits: ServiceLimits,
    // Serializes sends per conversation so ordering by id matches the order
    // subscribers observe events in.
    send_locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl ConversationService {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        bus: Arc<dyn EventBus>,
        typing: Arc<TypingCache>,
        limits: ServiceLimits,
    ) -> Self {
        Self {
            store,
            bus,
            typing,
            limits,
            send_locks: DashMap::new(),
        }
    }

    pub fn typing_cache(&self) -> &TypingCache {
        &self.typing
    }

    pub fn typing_users(&self, conversation_id: Uuid) -> Vec<Uuid> {
        self.typing.typing_users(conversation_id)
    }

    /// Fan-out failures are logged rather than bubbled: the state change has
    /// already committed and clients can recover via history.
    async fn broadcast(&self, topic: Topic, event: &DomainEvent) {
        if let Err(e) = self.bus.publish(topic, event).await {
            warn!(event = event.event_type(), %topic, "event fan-out failed: {e}");
        }
    }

    async fn require_active_participant(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<(Conversation, Participant)> {
        let conversation = self
            .store
            .conversation(conversation_id)
            .await?
            .ok_or(AppError::NotFound("conversation"))?;
        let participant = self
            .store
            .participant(conversation_id, user_id)
            .await?
            .filter(|p| p.is_active())
            .ok_or(AppError::Authorization)?;
        Ok((conversation, participant))
    }

    fn send_lock(&self, conversation_id: Uuid) -> Arc<Mutex<()>> {
        self.send_locks
            .entry(conversation_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // --- conversations -----------------------------------------------------

    pub async fn find_or_create_direct(&self, a: Uuid, b: Uuid) -> AppResult<Conversation> {
        if a == b {
            return Err(AppError::Validation(
                "cannot open a conversation with yourself".into(),
            ));
        }
        if let Some(existing) = self.store.find_direct(a, b).await? {
            return Ok(existing);
        }
        self.store
            .create_direct(a, b, ConversationSettings::default())
            .await
    }

    pub async fn create_group(
        &self,
        creator: Uuid,
        name: String,
        avatar_url: Option<String>,
        members: Vec<Uuid>,
    ) -> AppResult<Conversation> {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(AppError::Validation("group name must not be empty".into()));
        }
        let mut unique: Vec<Uuid> = members;
        unique.sort_unstable();
        unique.dedup();
        unique.retain(|u| *u != creator);
        if unique.is_empty() {
            return Err(AppError::Validation("group needs at least one member".into()));
        }
        // Creator counts toward the cap.
        if unique.len() + 1 > self.limits.max_group_members {
            return Err(AppError::Validation(format!(
                "group cannot exceed {} members",
                self.limits.max_group_members
            )));
        }
        self.store
            .create_group(creator, name, avatar_url, unique, ConversationSettings::default())
            .await
    }

    /// Flags the conversation as encrypted with an opaque reference to key
    /// material negotiated elsewhere. Idempotent once set.
    pub async fn enable_encryption(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        key_reference: String,
    ) -> AppResult<Conversation> {
        self.require_active_participant(conversation_id, user_id)
            .await?;
        let key_reference = key_reference.trim().to_string();
        if key_reference.is_empty() {
            return Err(AppError::Validation("key reference must not be empty".into()));
        }
        self.store.set_encryption(conversation_id, key_reference).await
    }

    pub async fn list_conversations(
        &self,
        user_id: Uuid,
        include_archived: bool,
    ) -> AppResult<Vec<ConversationSummary>> {
        self.store
            .list_conversations(user_id, include_archived, self.limits.page_limit)
            .await
    }

    pub async fn subscription_topics(&self, user_id: Uuid) -> AppResult<Vec<Topic>> {
        let mut topics = vec![Topic::User(user_id)];
        for id in self.store.active_conversation_ids(user_id).await? {
            topics.push(Topic::Conversation(id));
        }
        Ok(topics)
    }

    // --- messages ----------------------------------------------------------

    pub async fn send_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        outgoing: OutgoingMessage,
    ) -> AppResult<Message> {
        let (conversation, _) = self
            .require_active_participant(conversation_id, sender_id)
            .await?;

        if !conversation.settings.allows(outgoing.kind) {
            return Err(AppError::Validation(format!(
                "{} messages are not allowed in this conversation",
                outgoing.kind.as_str()
            )));
        }

        let content = outgoing
            .content
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());
        if outgoing.kind == MessageKind::Text && content.is_none() {
            return Err(AppError::Validation("text messages need content".into()));
        }
        if outgoing.kind.requires_attachment() && outgoing.attachments.is_empty() {
            return Err(AppError::Validation(format!(
                "{} messages need an attachment",
                outgoing.kind.as_str()
            )));
        }
        for attachment in &outgoing.attachments {
            if attachment.size_bytes > conversation.settings.max_attachment_bytes {
                return Err(AppError::Validation("attachment exceeds size limit".into()));
            }
        }

        if let Some(reply_to) = outgoing.reply_to_id {
            let target = self
                .store
                .message(reply_to)
                .await?
                .ok_or(AppError::NotFound("message"))?;
            if target.conversation_id != conversation_id {
                return Err(AppError::Validation(
                    "cannot reply across conversations".into(),
                ));
            }
        }
        if let Some(source) = outgoing.forwarded_from_id {
            self.store
                .message(source)
                .await?
                .ok_or(AppError::NotFound("message"))?;
        }

        let expires_at = outgoing
            .expires_in_secs
            .map(|secs| Utc::now() + Duration::seconds(secs as i64));

        let new = NewMessage {
            kind: outgoing.kind,
            content,
            metadata: outgoing.metadata,
            attachments: outgoing.attachments,
            reply_to_id: outgoing.reply_to_id,
            forwarded_from_id: outgoing.forwarded_from_id,
            expires_at,
        };

        // Lock held across persist and publish: subscribers see new_message
        // events in id order.
        let lock = self.send_lock(conversation_id);
        let _guard = lock.lock().await;

        let message = self
            .store
            .append_message(conversation_id, sender_id, new)
            .await?;
        // Sending is also an implicit stopped-typing signal.
        if self.typing.set_typing(conversation_id, sender_id, false) {
            self.broadcast(
                Topic::Conversation(conversation_id),
                &DomainEvent::TypingStatus {
                    conversation_id,
                    user_id: sender_id,
                    is_typing: false,
                },
            )
            .await;
        }
        self.broadcast(
            Topic::Conversation(conversation_id),
            &DomainEvent::NewMessage {
                conversation_id,
                message: message.clone(),
            },
        )
        .await;

        Ok(message)
    }

    pub async fn list_messages(
        &self,
        conversation_id: Uuid,
        requester: Uuid,
        mut query: MessageQuery,
    ) -> AppResult<Vec<Message>> {
        self.require_active_participant(conversation_id, requester)
            .await?;
        if query.limit <= 0 || query.limit > self.limits.page_limit {
            query.limit = self.limits.page_limit;
        }
        self.store
            .list_messages(conversation_id, requester, query)
            .await
    }

    pub async fn mark_as_read(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        message_ids: Vec<i64>,
    ) -> AppResult<Vec<i64>> {
        self.require_active_participant(conversation_id, user_id)
            .await?;
        if message_ids.is_empty() {
            return Ok(vec![]);
        }
        let outcome = self
            .store
            .apply_read_receipts(conversation_id, user_id, &message_ids)
            .await?;
        if !outcome.newly_read.is_empty() {
            self.broadcast(
                Topic::Conversation(conversation_id),
                &DomainEvent::MessagesRead {
                    conversation_id,
                    user_id,
                    message_ids: outcome.newly_read.clone(),
                },
            )
            .await;
        }
        Ok(outcome.newly_read)
    }

    pub async fn set_typing(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        is_typing: bool,
    ) -> AppResult<()> {
        self.require_active_participant(conversation_id, user_id)
            .await?;
        if self.typing.set_typing(conversation_id, user_id, is_typing) {
            self.broadcast(
                Topic::Conversation(conversation_id),
                &DomainEvent::TypingStatus {
                    conversation_id,
                    user_id,
                    is_typing,
                },
            )
            .await;
        }
        Ok(())
    }

    pub async fn toggle_reaction(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        message_id: i64,
        symbol: &str,
    ) -> AppResult<()> {
        self.require_active_participant(conversation_id, user_id)
            .await?;
        let symbol = symbol.trim();
        if symbol.is_empty() || symbol.len() > 16 {
            return Err(AppError::Validation(
                "reaction must be 1 to 16 bytes".into(),
            ));
        }
        let message = self
            .store
            .message(message_id)
            .await?
            .filter(|m| m.conversation_id == conversation_id)
            .ok_or(AppError::NotFound("message"))?;
        if message.is_deleted {
            return Err(AppError::State("cannot react to a deleted message".into()));
        }
        let action = self.store.toggle_reaction(message_id, user_id, symbol).await?;
        self.broadcast(
            Topic::Conversation(conversation_id),
            &DomainEvent::ReactionUpdate {
                conversation_id,
                message_id,
                user_id,
                symbol: symbol.to_string(),
                action,
            },
        )
        .await;
        Ok(())
    }

    pub async fn reactions(&self, message_id: i64) -> AppResult<Vec<Reaction>> {
        self.store.reactions(message_id).await
    }

    pub async fn delete_message(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        message_id: i64,
        for_everyone: bool,
    ) -> AppResult<()> {
        self.require_active_participant(conversation_id, user_id)
            .await?;
        let message = self
            .store
            .message(message_id)
            .await?
            .filter(|m| m.conversation_id == conversation_id)
            .ok_or(AppError::NotFound("message"))?;

        if for_everyone {
            if message.sender_id != user_id {
                return Err(AppError::Authorization);
            }
            let window = Duration::hours(self.limits.delete_window_hours);
            if Utc::now() - message.created_at > window {
                return Err(AppError::State(format!(
                    "messages can only be deleted for everyone within {} hours",
                    self.limits.delete_window_hours
                )));
            }
            self.store.delete_for_everyone(message_id).await?;
            self.broadcast(
                Topic::Conversation(conversation_id),
                &DomainEvent::MessageDeleted {
                    conversation_id,
                    message_id,
                    deleted_by: user_id,
                    for_everyone: true,
                },
            )
            .await;
        } else {
            self.store.delete_for_user(message_id, user_id).await?;
            // Only the caller's own sessions need to hide the message.
            self.broadcast(
                Topic::User(user_id),
                &DomainEvent::MessageDeleted {
                    conversation_id,
                    message_id,
                    deleted_by: user_id,
                    for_everyone: false,
                },
            )
            .await;
        }
        Ok(())
    }

    pub async fn edit_message(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        message_id: i64,
        new_content: String,
    ) -> AppResult<Message> {
        self.require_active_participant(conversation_id, user_id)
            .await?;
        let message = self
            .store
            .message(message_id)
            .await?
            .filter(|m| m.conversation_id == conversation_id)
            .ok_or(AppError::NotFound("message"))?;

        if message.sender_id != user_id {
            return Err(AppError::Authorization);
        }
        if message.is_deleted {
            return Err(AppError::State("cannot edit a deleted message".into()));
        }
        if message.kind != MessageKind::Text {
            return Err(AppError::Validation("only text messages can be edited".into()));
        }
        let new_content = new_content.trim().to_string();
        if new_content.is_empty() {
            return Err(AppError::Validation("edited content must not be empty".into()));
        }

        let prior = EditRecord {
            content: message.content.clone(),
            edited_at: Utc::now(),
        };
        let updated = self.store.apply_edit(message_id, new_content, prior).await?;
        self.broadcast(
            Topic::Conversation(conversation_id),
            &DomainEvent::MessageEdited {
                conversation_id,
                message_id,
                new_content: updated.content.clone().unwrap_or_default(),
                edited_by: user_id,
                edited_at: updated.edited_at.unwrap_or_else(Utc::now),
            },
        )
        .await;
        Ok(updated)
    }

    // --- drafts and per-user flags ----------------------------------------

    pub async fn save_draft(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        content: String,
        reply_to_id: Option<i64>,
    ) -> AppResult<Draft> {
        self.require_active_participant(conversation_id, user_id)
            .await?;
        self.store
            .save_draft(conversation_id, user_id, content, reply_to_id)
            .await
    }

    pub async fn draft(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<Option<Draft>> {
        self.store.draft(conversation_id, user_id).await
    }

    pub async fn toggle_pin(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<Participant> {
        self.require_active_participant(conversation_id, user_id)
            .await?;
        self.store.toggle_pin(conversation_id, user_id).await
    }

    pub async fn toggle_mute(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        duration_hours: Option<i64>,
    ) -> AppResult<Participant> {
        self.require_active_participant(conversation_id, user_id)
            .await?;
        let muted_until = duration_hours.map(|hours| Utc::now() + Duration::hours(hours));
        self.store
            .toggle_mute(conversation_id, user_id, muted_until)
            .await
    }

    pub async fn toggle_archive(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<Participant> {
        self.require_active_participant(conversation_id, user_id)
            .await?;
        self.store.toggle_archive(conversation_id, user_id).await
    }

    // --- calls -------------------------------------------------------------

    pub async fn start_call(
        &self,
        conversation_id: Uuid,
        caller_id: Uuid,
        kind: CallKind,
    ) -> AppResult<CallRecord> {
        self.require_active_participant(conversation_id, caller_id)
            .await?;
        let call = self
            .store
            .insert_call(CallRecord {
                id: 0,
                conversation_id,
                caller_id,
                kind,
                status: CallStatus::Initiated,
                started_at: Utc::now(),
                answered_at: None,
                ended_at: None,
                duration_seconds: None,
                participants: vec![caller_id],
            })
            .await?;

        let event = DomainEvent::IncomingCall {
            conversation_id,
            call: call.clone(),
            caller: caller_id,
        };
        self.broadcast(Topic::Conversation(conversation_id), &event)
            .await;
        // Ring callees directly as well, so a callee not yet subscribed to
        // the conversation topic still hears the call.
        for participant in self.store.active_participants(conversation_id).await? {
            if participant.user_id != caller_id {
                self.broadcast(Topic::User(participant.user_id), &event).await;
            }
        }
        Ok(call)
    }

    pub async fn update_call_status(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        call_id: i64,
        status: CallStatus,
    ) -> AppResult<CallRecord> {
        self.require_active_participant(conversation_id, user_id)
            .await?;
        let mut call = self
            .store
            .call(call_id)
            .await?
            .filter(|c| c.conversation_id == conversation_id)
            .ok_or(AppError::NotFound("call"))?;

        if !call.apply_status(status, Some(user_id), Utc::now()) {
            return Err(AppError::State("call has already ended".into()));
        }
        self.store.update_call(&call).await?;
        self.broadcast(
            Topic::Conversation(conversation_id),
            &DomainEvent::CallStatusUpdate {
                conversation_id,
                call_id,
                status: call.status,
                actor: Some(user_id),
            },
        )
        .await;
        Ok(call)
    }

    /// Relays an opaque signalling frame to every other participant's
    /// sessions. The payload is never inspected.
    pub async fn relay_signal(
        &self,
        conversation_id: Uuid,
        from: Uuid,
        payload: Value,
    ) -> AppResult<()> {
        self.require_active_participant(conversation_id, from).await?;
        let event = DomainEvent::Signal {
            conversation_id,
            from,
            payload,
        };
        for participant in self.store.active_participants(conversation_id).await? {
            if participant.user_id != from {
                self.broadcast(Topic::User(participant.user_id), &event).await;
            }
        }
        Ok(())
    }

    // --- maintenance -------------------------------------------------------

    /// Tombstones expired messages and fans out their deletion. Returns how
    /// many messages lapsed.
    pub async fn sweep_expired(&self) -> AppResult<usize> {
        let expired = self.store.expire_messages(Utc::now()).await?;
        let count = expired.len();
        for (conversation_id, message_id) in expired {
            self.broadcast(
                Topic::Conversation(conversation_id),
                &DomainEvent::MessageDeleted {
                    conversation_id,
                    message_id,
                    deleted_by: Uuid::nil(),
                    for_everyone: true,
                },
            )
            .await;
        }
        if count > 0 {
            info!(count, "expired messages swept");
        }
        Ok(count)
    }

    /// Drops lapsed typing entries and announces each as stopped typing.
    pub async fn sweep_typing(&self) {
        for (conversation_id, user_id) in self.typing.sweep() {
            self.broadcast(
                Topic::Conversation(conversation_id),
                &DomainEvent::TypingStatus {
                    conversation_id,
                    user_id,
                    is_typing: false,
                },
            )
            .await;
        }
    }
}
