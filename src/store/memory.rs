//! In-memory store used by unit and integration tests. Mirrors the
//! Postgres backend's semantics without requiring a database.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{
    direct_key, CallRecord, CallStatus, Conversation, ConversationKind, ConversationSettings,
    Draft, EditRecord, Message, MessageStatus, Participant, ParticipantRole, Reaction,
    ReactionAction,
};
use crate::store::{
    ConversationStore, ConversationSummary, MessageQuery, NewMessage, ReadOutcome,
};

#[derive(Default)]
struct Inner {
    conversations: HashMap<Uuid, Conversation>,
    direct_index: HashMap<String, Uuid>,
    participants: HashMap<(Uuid, Uuid), Participant>,
    messages: BTreeMap<i64, Message>,
    receipts: HashMap<i64, HashMap<Uuid, DateTime<Utc>>>,
    reactions: Vec<Reaction>,
    drafts: HashMap<(Uuid, Uuid), Draft>,
    calls: HashMap<i64, CallRecord>,
    next_message_id: i64,
    next_call_id: i64,
}

pub struct MemoryConversationStore {
    inner: Mutex<Inner>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_message_id: 1,
                next_call_id: 1,
                ..Inner::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for MemoryConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

fn visible_to(msg: &Message, requester: Uuid) -> bool {
    !msg.hidden_for(requester)
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn find_direct(&self, a: Uuid, b: Uuid) -> AppResult<Option<Conversation>> {
        let inner = self.lock();
        let key = direct_key(a, b);
        Ok(inner
            .direct_index
            .get(&key)
            .and_then(|id| inner.conversations.get(id))
            .cloned())
    }

    async fn create_direct(
        &self,
        a: Uuid,
        b: Uuid,
        settings: ConversationSettings,
    ) -> AppResult<Conversation> {
        let mut inner = self.lock();
        let key = direct_key(a, b);
        if let Some(existing) = inner.direct_index.get(&key).copied() {
            if let Some(conv) = inner.conversations.get(&existing) {
                return Ok(conv.clone());
            }
        }
        let now = Utc::now();
        let conv = Conversation {
            id: Uuid::new_v4(),
            kind: ConversationKind::Direct,
            name: None,
            avatar_url: None,
            created_by: a,
            settings,
            is_encrypted: false,
            encryption_key: None,
            last_message_id: None,
            last_message_at: None,
            created_at: now,
            updated_at: now,
        };
        inner.direct_index.insert(key, conv.id);
        for user in [a, b] {
            inner.participants.insert(
                (conv.id, user),
                Participant::new(conv.id, user, ParticipantRole::Member),
            );
        }
        inner.conversations.insert(conv.id, conv.clone());
        Ok(conv)
    }

    async fn create_group(
        &self,
        creator: Uuid,
        name: String,
        avatar_url: Option<String>,
        members: Vec<Uuid>,
        settings: ConversationSettings,
    ) -> AppResult<Conversation> {
        let mut inner = self.lock();
        let now = Utc::now();
        let conv = Conversation {
            id: Uuid::new_v4(),
            kind: ConversationKind::Group,
            name: Some(name),
            avatar_url,
            created_by: creator,
            settings,
            is_encrypted: false,
            encryption_key: None,
            last_message_id: None,
            last_message_at: None,
            created_at: now,
            updated_at: now,
        };
        inner.participants.insert(
            (conv.id, creator),
            Participant::new(conv.id, creator, ParticipantRole::Owner),
        );
        for user in members {
            if user == creator {
                continue;
            }
            inner.participants.insert(
                (conv.id, user),
                Participant::new(conv.id, user, ParticipantRole::Member),
            );
        }
        inner.conversations.insert(conv.id, conv.clone());
        Ok(conv)
    }

    async fn conversation(&self, id: Uuid) -> AppResult<Option<Conversation>> {
        Ok(self.lock().conversations.get(&id).cloned())
    }

    async fn set_encryption(
        &self,
        conversation_id: Uuid,
        key_reference: String,
    ) -> AppResult<Conversation> {
        let mut inner = self.lock();
        let conv = inner
            .conversations
            .get_mut(&conversation_id)
            .ok_or(AppError::NotFound("conversation"))?;
        if !conv.is_encrypted {
            conv.is_encrypted = true;
            conv.encryption_key = Some(key_reference);
            conv.updated_at = Utc::now();
        }
        Ok(conv.clone())
    }

    async fn participant(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<Option<Participant>> {
        Ok(self
            .lock()
            .participants
            .get(&(conversation_id, user_id))
            .cloned())
    }

    async fn active_participants(&self, conversation_id: Uuid) -> AppResult<Vec<Participant>> {
        Ok(self
            .lock()
            .participants
            .values()
            .filter(|p| p.conversation_id == conversation_id && p.is_active())
            .cloned()
            .collect())
    }

    async fn active_conversation_ids(&self, user_id: Uuid) -> AppResult<Vec<Uuid>> {
        Ok(self
            .lock()
            .participants
            .values()
            .filter(|p| p.user_id == user_id && p.is_active())
            .map(|p| p.conversation_id)
            .collect())
    }

    async fn list_conversations(
        &self,
        user_id: Uuid,
        include_archived: bool,
        limit: i64,
    ) -> AppResult<Vec<ConversationSummary>> {
        let inner = self.lock();
        let mut summaries: Vec<ConversationSummary> = inner
            .participants
            .values()
            .filter(|p| p.user_id == user_id && p.is_active())
            .filter(|p| include_archived || !p.is_archived)
            .filter_map(|p| {
                let conversation = inner.conversations.get(&p.conversation_id)?.clone();
                let floor = p.last_read_message_id.unwrap_or(0);
                let unread_count = inner
                    .messages
                    .values()
                    .filter(|m| {
                        m.conversation_id == p.conversation_id
                            && m.sender_id != user_id
                            && m.id > floor
                            && !m.is_deleted
                            && !m.hidden_for(user_id)
                    })
                    .count() as i64;
                Some(ConversationSummary {
                    conversation,
                    participant: p.clone(),
                    unread_count,
                })
            })
            .collect();
        // Pinned first, then most recent activity.
        summaries.sort_by(|a, b| {
            b.participant
                .is_pinned
                .cmp(&a.participant.is_pinned)
                .then_with(|| {
                    b.conversation
                        .last_message_at
                        .unwrap_or(b.conversation.created_at)
                        .cmp(
                            &a.conversation
                                .last_message_at
                                .unwrap_or(a.conversation.created_at),
                        )
                })
        });
        summaries.truncate(limit.max(0) as usize);
        Ok(summaries)
    }

    async fn append_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        new: NewMessage,
    ) -> AppResult<Message> {
        let mut inner = self.lock();
        let now = Utc::now();
        let id = inner.next_message_id;
        inner.next_message_id += 1;
        let message = Message {
            id,
            conversation_id,
            sender_id,
            kind: new.kind,
            content: new.content,
            metadata: new.metadata,
            attachments: new.attachments,
            reply_to_id: new.reply_to_id,
            forwarded_from_id: new.forwarded_from_id,
            is_edited: false,
            edited_at: None,
            edit_history: vec![],
            is_deleted: false,
            deleted_at: None,
            deleted_for: vec![],
            status: MessageStatus::Sent,
            delivered_at: None,
            created_at: now,
            expires_at: new.expires_at,
        };
        inner.messages.insert(id, message.clone());
        if let Some(conv) = inner.conversations.get_mut(&conversation_id) {
            conv.last_message_id = Some(id);
            conv.last_message_at = Some(now);
            conv.updated_at = now;
        }
        inner.drafts.remove(&(conversation_id, sender_id));
        Ok(message)
    }

    async fn message(&self, id: i64) -> AppResult<Option<Message>> {
        Ok(self.lock().messages.get(&id).cloned())
    }

    async fn list_messages(
        &self,
        conversation_id: Uuid,
        requester: Uuid,
        query: MessageQuery,
    ) -> AppResult<Vec<Message>> {
        let inner = self.lock();
        let limit = if query.limit <= 0 { 50 } else { query.limit } as usize;
        let mut page: Vec<Message> = if let Some(after) = query.after_id {
            inner
                .messages
                .range((Bound::Excluded(after), Bound::Unbounded))
                .map(|(_, m)| m)
                .filter(|m| m.conversation_id == conversation_id && visible_to(m, requester))
                .filter(|m| query.before_id.map_or(true, |before| m.id < before))
                .take(limit)
                .cloned()
                .collect()
        } else {
            // Newest page first, then flip to chronological order.
            let mut newest: Vec<Message> = inner
                .messages
                .values()
                .rev()
                .filter(|m| m.conversation_id == conversation_id && visible_to(m, requester))
                .filter(|m| query.before_id.map_or(true, |before| m.id < before))
                .take(limit)
                .cloned()
                .collect();
            newest.reverse();
            newest
        };
        // Other users' hide lists are not part of the requester's view.
        for msg in &mut page {
            msg.deleted_for.clear();
        }
        Ok(page)
    }

    async fn apply_read_receipts(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        message_ids: &[i64],
    ) -> AppResult<ReadOutcome> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let now = Utc::now();
        let mut newly_read = Vec::new();
        let mut max_id = 0i64;
        for &id in message_ids {
            let belongs = inner
                .messages
                .get(&id)
                .map(|m| m.conversation_id == conversation_id && m.sender_id != user_id)
                .unwrap_or(false);
            if !belongs {
                continue;
            }
            let per_message = inner.receipts.entry(id).or_default();
            if per_message.contains_key(&user_id) {
                continue;
            }
            per_message.insert(user_id, now);
            newly_read.push(id);
            max_id = max_id.max(id);
            if let Some(msg) = inner.messages.get_mut(&id) {
                if msg.status.can_transition(MessageStatus::Read) {
                    if msg.delivered_at.is_none() {
                        msg.delivered_at = Some(now);
                    }
                    msg.status = MessageStatus::Read;
                }
            }
        }
        if max_id > 0 {
            if let Some(part) = inner.participants.get_mut(&(conversation_id, user_id)) {
                if part.last_read_message_id.unwrap_or(0) < max_id {
                    part.last_read_message_id = Some(max_id);
                    part.last_read_at = Some(now);
                }
            }
        }
        Ok(ReadOutcome { newly_read })
    }

    async fn delete_for_everyone(&self, message_id: i64) -> AppResult<Message> {
        let mut inner = self.lock();
        let msg = inner
            .messages
            .get_mut(&message_id)
            .ok_or(AppError::NotFound("message"))?;
        msg.tombstone(Utc::now());
        Ok(msg.clone())
    }

    async fn delete_for_user(&self, message_id: i64, user_id: Uuid) -> AppResult<()> {
        let mut inner = self.lock();
        let msg = inner
            .messages
            .get_mut(&message_id)
            .ok_or(AppError::NotFound("message"))?;
        if !msg.deleted_for.contains(&user_id) {
            msg.deleted_for.push(user_id);
        }
        Ok(())
    }

    async fn apply_edit(
        &self,
        message_id: i64,
        new_content: String,
        prior: EditRecord,
    ) -> AppResult<Message> {
        let mut inner = self.lock();
        let msg = inner
            .messages
            .get_mut(&message_id)
            .ok_or(AppError::NotFound("message"))?;
        msg.edit_history.push(prior);
        msg.content = Some(new_content);
        msg.is_edited = true;
        msg.edited_at = Some(Utc::now());
        Ok(msg.clone())
    }

    async fn toggle_reaction(
        &self,
        message_id: i64,
        user_id: Uuid,
        symbol: &str,
    ) -> AppResult<ReactionAction> {
        let mut inner = self.lock();
        if !inner.messages.contains_key(&message_id) {
            return Err(AppError::NotFound("message"));
        }
        let before = inner.reactions.len();
        inner
            .reactions
            .retain(|r| !(r.message_id == message_id && r.user_id == user_id && r.symbol == symbol));
        if inner.reactions.len() < before {
            return Ok(ReactionAction::Removed);
        }
        inner.reactions.push(Reaction {
            message_id,
            user_id,
            symbol: symbol.to_string(),
            created_at: Utc::now(),
        });
        Ok(ReactionAction::Added)
    }

    async fn reactions(&self, message_id: i64) -> AppResult<Vec<Reaction>> {
        Ok(self
            .lock()
            .reactions
            .iter()
            .filter(|r| r.message_id == message_id)
            .cloned()
            .collect())
    }

    async fn save_draft(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        content: String,
        reply_to_id: Option<i64>,
    ) -> AppResult<Draft> {
        let mut inner = self.lock();
        let draft = Draft {
            conversation_id,
            user_id,
            content,
            reply_to_id,
            updated_at: Utc::now(),
        };
        inner
            .drafts
            .insert((conversation_id, user_id), draft.clone());
        Ok(draft)
    }

    async fn draft(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<Option<Draft>> {
        Ok(self
            .lock()
            .drafts
            .get(&(conversation_id, user_id))
            .cloned())
    }

    async fn toggle_pin(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<Participant> {
        let mut inner = self.lock();
        let part = inner
            .participants
            .get_mut(&(conversation_id, user_id))
            .ok_or(AppError::NotFound("participant"))?;
        part.is_pinned = !part.is_pinned;
        part.pinned_at = part.is_pinned.then(Utc::now);
        Ok(part.clone())
    }

    async fn toggle_mute(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        muted_until: Option<DateTime<Utc>>,
    ) -> AppResult<Participant> {
        let mut inner = self.lock();
        let part = inner
            .participants
            .get_mut(&(conversation_id, user_id))
            .ok_or(AppError::NotFound("participant"))?;
        part.is_muted = !part.is_muted;
        part.muted_until = if part.is_muted { muted_until } else { None };
        Ok(part.clone())
    }

    async fn toggle_archive(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<Participant> {
        let mut inner = self.lock();
        let part = inner
            .participants
            .get_mut(&(conversation_id, user_id))
            .ok_or(AppError::NotFound("participant"))?;
        part.is_archived = !part.is_archived;
        part.archived_at = part.is_archived.then(Utc::now);
        Ok(part.clone())
    }

    async fn insert_call(&self, mut call: CallRecord) -> AppResult<CallRecord> {
        let mut inner = self.lock();
        call.id = inner.next_call_id;
        inner.next_call_id += 1;
        inner.calls.insert(call.id, call.clone());
        Ok(call)
    }

    async fn call(&self, id: i64) -> AppResult<Option<CallRecord>> {
        Ok(self.lock().calls.get(&id).cloned())
    }

    async fn update_call(&self, call: &CallRecord) -> AppResult<()> {
        let mut inner = self.lock();
        match inner.calls.get_mut(&call.id) {
            Some(existing) if existing.status != CallStatus::Ended => {
                *existing = call.clone();
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(AppError::NotFound("call")),
        }
    }

    async fn expire_messages(&self, now: DateTime<Utc>) -> AppResult<Vec<(Uuid, i64)>> {
        let mut inner = self.lock();
        let mut expired = Vec::new();
        for msg in inner.messages.values_mut() {
            if msg.is_deleted {
                continue;
            }
            if let Some(expiry) = msg.expires_at {
                if expiry <= now {
                    msg.tombstone(now);
                    expired.push((msg.conversation_id, msg.id));
                }
            }
        }
        Ok(expired)
    }
}
