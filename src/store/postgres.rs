use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{
    direct_key, Attachment, CallKind, CallRecord, CallStatus, Conversation, ConversationKind,
    ConversationSettings, Draft, EditRecord, Message, MessageKind, MessageMeta, MessageStatus,
    Participant, ParticipantRole, ParticipantStatus, Reaction, ReactionAction,
};
use crate::store::{
    ConversationStore, ConversationSummary, MessageQuery, NewMessage, ReadOutcome,
};

const CONVERSATION_COLUMNS: &str = "id, kind, name, avatar_url, created_by, settings, \
     is_encrypted, encryption_key, last_message_id, last_message_at, created_at, updated_at";

const PARTICIPANT_COLUMNS: &str = "conversation_id, user_id, role, status, last_read_message_id, \
     last_read_at, notifications_enabled, is_muted, muted_until, is_pinned, pinned_at, \
     is_archived, archived_at, joined_at, left_at";

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, kind, content, metadata, \
     attachments, reply_to_id, forwarded_from_id, is_edited, edited_at, edit_history, \
     is_deleted, deleted_at, deleted_for, status, delivered_at, created_at, expires_at";

const CALL_COLUMNS: &str = "id, conversation_id, caller_id, kind, status, started_at, \
     answered_at, ended_at, duration_seconds, participants";

pub struct PgConversationStore {
    pool: Pool<Postgres>,
}

impl PgConversationStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

fn bad_enum(column: &'static str, raw: &str) -> AppError {
    AppError::State(format!("unexpected {column} value in storage: {raw}"))
}

fn conversation_from_row(row: &PgRow) -> AppResult<Conversation> {
    let kind_raw: String = row.try_get("kind")?;
    let settings: Json<ConversationSettings> = row.try_get("settings")?;
    Ok(Conversation {
        id: row.try_get("id")?,
        kind: ConversationKind::parse(&kind_raw).ok_or_else(|| bad_enum("kind", &kind_raw))?,
        name: row.try_get("name")?,
        avatar_url: row.try_get("avatar_url")?,
        created_by: row.try_get("created_by")?,
        settings: settings.0,
        is_encrypted: row.try_get("is_encrypted")?,
        encryption_key: row.try_get("encryption_key")?,
        last_message_id: row.try_get("last_message_id")?,
        last_message_at: row.try_get("last_message_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn participant_from_row(row: &PgRow) -> AppResult<Participant> {
    let role_raw: String = row.try_get("role")?;
    let status_raw: String = row.try_get("status")?;
    Ok(Participant {
        conversation_id: row.try_get("conversation_id")?,
        user_id: row.try_get("user_id")?,
        role: ParticipantRole::parse(&role_raw).ok_or_else(|| bad_enum("role", &role_raw))?,
        status: ParticipantStatus::parse(&status_raw)
            .ok_or_else(|| bad_enum("status", &status_raw))?,
        last_read_message_id: row.try_get("last_read_message_id")?,
        last_read_at: row.try_get("last_read_at")?,
        notifications_enabled: row.try_get("notifications_enabled")?,
        is_muted: row.try_get("is_muted")?,
        muted_until: row.try_get("muted_until")?,
        is_pinned: row.try_get("is_pinned")?,
        pinned_at: row.try_get("pinned_at")?,
        is_archived: row.try_get("is_archived")?,
        archived_at: row.try_get("archived_at")?,
        joined_at: row.try_get("joined_at")?,
        left_at: row.try_get("left_at")?,
    })
}

fn message_from_row(row: &PgRow) -> AppResult<Message> {
    let kind_raw: String = row.try_get("kind")?;
    let status_raw: String = row.try_get("status")?;
    let metadata: Json<MessageMeta> = row.try_get("metadata")?;
    let attachments: Json<Vec<Attachment>> = row.try_get("attachments")?;
    let edit_history: Json<Vec<EditRecord>> = row.try_get("edit_history")?;
    let deleted_for: Json<Vec<Uuid>> = row.try_get("deleted_for")?;
    Ok(Message {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        sender_id: row.try_get("sender_id")?,
        kind: MessageKind::parse(&kind_raw).ok_or_else(|| bad_enum("kind", &kind_raw))?,
        content: row.try_get("content")?,
        metadata: metadata.0,
        attachments: attachments.0,
        reply_to_id: row.try_get("reply_to_id")?,
        forwarded_from_id: row.try_get("forwarded_from_id")?,
        is_edited: row.try_get("is_edited")?,
        edited_at: row.try_get("edited_at")?,
        edit_history: edit_history.0,
        is_deleted: row.try_get("is_deleted")?,
        deleted_at: row.try_get("deleted_at")?,
        deleted_for: deleted_for.0,
        status: MessageStatus::parse(&status_raw)
            .ok_or_else(|| bad_enum("status", &status_raw))?,
        delivered_at: row.try_get("delivered_at")?,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
    })
}

fn call_from_row(row: &PgRow) -> AppResult<CallRecord> {
    let kind_raw: String = row.try_get("kind")?;
    let status_raw: String = row.try_get("status")?;
    let participants: Json<Vec<Uuid>> = row.try_get("participants")?;
    Ok(CallRecord {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        caller_id: row.try_get("caller_id")?,
        kind: CallKind::parse(&kind_raw).ok_or_else(|| bad_enum("kind", &kind_raw))?,
        status: CallStatus::parse(&status_raw)
            .ok_or_else(|| bad_enum("status", &status_raw))?,
        started_at: row.try_get("started_at")?,
        answered_at: row.try_get("answered_at")?,
        ended_at: row.try_get("ended_at")?,
        duration_seconds: row.try_get("duration_seconds")?,
        participants: participants.0,
    })
}

fn draft_from_row(row: &PgRow) -> AppResult<Draft> {
    Ok(Draft {
        conversation_id: row.try_get("conversation_id")?,
        user_id: row.try_get("user_id")?,
        content: row.try_get("content")?,
        reply_to_id: row.try_get("reply_to_id")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl ConversationStore for PgConversationStore {
    async fn find_direct(&self, a: Uuid, b: Uuid) -> AppResult<Option<Conversation>> {
        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE direct_key = $1"
        ))
        .bind(direct_key(a, b))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(conversation_from_row).transpose()
    }

    async fn create_direct(
        &self,
        a: Uuid,
        b: Uuid,
        settings: ConversationSettings,
    ) -> AppResult<Conversation> {
        let key = direct_key(a, b);
        let mut tx = self.pool.begin().await?;

        // ON CONFLICT DO NOTHING keeps concurrent creators from racing two
        // rows into existence; the loser re-reads the winner's row.
        let inserted = sqlx::query(&format!(
            "INSERT INTO conversations (id, kind, created_by, settings, direct_key) \
             VALUES ($1, 'direct', $2, $3, $4) \
             ON CONFLICT (direct_key) DO NOTHING \
             RETURNING {CONVERSATION_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(a)
        .bind(Json(&settings))
        .bind(&key)
        .fetch_optional(&mut *tx)
        .await?;

        let conversation = match inserted {
            Some(ref row) => {
                let conv = conversation_from_row(row)?;
                for user in [a, b] {
                    sqlx::query(
                        "INSERT INTO conversation_participants (conversation_id, user_id, role) \
                         VALUES ($1, $2, 'member')",
                    )
                    .bind(conv.id)
                    .bind(user)
                    .execute(&mut *tx)
                    .await?;
                }
                conv
            }
            None => {
                let row = sqlx::query(&format!(
                    "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE direct_key = $1"
                ))
                .bind(&key)
                .fetch_one(&mut *tx)
                .await?;
                conversation_from_row(&row)?
            }
        };

        tx.commit().await?;
        Ok(conversation)
    }

    async fn create_group(
        &self,
        creator: Uuid,
        name: String,
        avatar_url: Option<String>,
        members: Vec<Uuid>,
        settings: ConversationSettings,
    ) -> AppResult<Conversation> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "INSERT INTO conversations (id, kind, name, avatar_url, created_by, settings) \
             VALUES ($1, 'group', $2, $3, $4, $5) \
             RETURNING {CONVERSATION_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(&name)
        .bind(&avatar_url)
        .bind(creator)
        .bind(Json(&settings))
        .fetch_one(&mut *tx)
        .await?;
        let conversation = conversation_from_row(&row)?;

        sqlx::query(
            "INSERT INTO conversation_participants (conversation_id, user_id, role) \
             VALUES ($1, $2, 'owner')",
        )
        .bind(conversation.id)
        .bind(creator)
        .execute(&mut *tx)
        .await?;

        for user in members.into_iter().filter(|u| *u != creator) {
            sqlx::query(
                "INSERT INTO conversation_participants (conversation_id, user_id, role) \
                 VALUES ($1, $2, 'member') ON CONFLICT DO NOTHING",
            )
            .bind(conversation.id)
            .bind(user)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(conversation)
    }

    async fn conversation(&self, id: Uuid) -> AppResult<Option<Conversation>> {
        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(conversation_from_row).transpose()
    }

    async fn set_encryption(
        &self,
        conversation_id: Uuid,
        key_reference: String,
    ) -> AppResult<Conversation> {
        // No-op when already encrypted so the key reference stays stable.
        let row = sqlx::query(&format!(
            "UPDATE conversations \
             SET is_encrypted = TRUE, encryption_key = $2, updated_at = NOW() \
             WHERE id = $1 AND is_encrypted = FALSE \
             RETURNING {CONVERSATION_COLUMNS}"
        ))
        .bind(conversation_id)
        .bind(&key_reference)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(ref row) => conversation_from_row(row),
            None => self
                .conversation(conversation_id)
                .await?
                .ok_or(AppError::NotFound("conversation")),
        }
    }

    async fn participant(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<Option<Participant>> {
        let row = sqlx::query(&format!(
            "SELECT {PARTICIPANT_COLUMNS} FROM conversation_participants \
             WHERE conversation_id = $1 AND user_id = $2"
        ))
        .bind(conversation_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(participant_from_row).transpose()
    }

    async fn active_participants(&self, conversation_id: Uuid) -> AppResult<Vec<Participant>> {
        let rows = sqlx::query(&format!(
            "SELECT {PARTICIPANT_COLUMNS} FROM conversation_participants \
             WHERE conversation_id = $1 AND status = 'active'"
        ))
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(participant_from_row).collect()
    }

    async fn active_conversation_ids(&self, user_id: Uuid) -> AppResult<Vec<Uuid>> {
        let rows = sqlx::query(
            "SELECT conversation_id FROM conversation_participants \
             WHERE user_id = $1 AND status = 'active'",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get("conversation_id").map_err(AppError::from))
            .collect()
    }

    async fn list_conversations(
        &self,
        user_id: Uuid,
        include_archived: bool,
        limit: i64,
    ) -> AppResult<Vec<ConversationSummary>> {
        let rows = sqlx::query(&format!(
            "SELECT c.id, c.kind, c.name, c.avatar_url, c.created_by, c.settings, \
                    c.is_encrypted, c.encryption_key, \
                    c.last_message_id, c.last_message_at, c.created_at, c.updated_at, \
                    p.conversation_id AS p_conversation_id, p.user_id, p.role, p.status, \
                    p.last_read_message_id, p.last_read_at, p.notifications_enabled, \
                    p.is_muted, p.muted_until, p.is_pinned, p.pinned_at, p.is_archived, \
                    p.archived_at, p.joined_at, p.left_at, \
                    (SELECT COUNT(*) FROM messages m \
                     WHERE m.conversation_id = c.id \
                       AND m.sender_id <> p.user_id \
                       AND m.id > COALESCE(p.last_read_message_id, 0) \
                       AND m.is_deleted = FALSE \
                       AND NOT jsonb_exists(m.deleted_for, p.user_id::text)) AS unread_count \
             FROM conversation_participants p \
             JOIN conversations c ON c.id = p.conversation_id \
             WHERE p.user_id = $1 AND p.status = 'active' \
               AND ($2 OR p.is_archived = FALSE) \
             ORDER BY p.is_pinned DESC, COALESCE(c.last_message_at, c.created_at) DESC \
             LIMIT $3"
        ))
        .bind(user_id)
        .bind(include_archived)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let conversation = conversation_from_row(row)?;
                let role_raw: String = row.try_get("role")?;
                let status_raw: String = row.try_get("status")?;
                let participant = Participant {
                    conversation_id: row.try_get("p_conversation_id")?,
                    user_id: row.try_get("user_id")?,
                    role: ParticipantRole::parse(&role_raw)
                        .ok_or_else(|| bad_enum("role", &role_raw))?,
                    status: ParticipantStatus::parse(&status_raw)
                        .ok_or_else(|| bad_enum("status", &status_raw))?,
                    last_read_message_id: row.try_get("last_read_message_id")?,
                    last_read_at: row.try_get("last_read_at")?,
                    notifications_enabled: row.try_get("notifications_enabled")?,
                    is_muted: row.try_get("is_muted")?,
                    muted_until: row.try_get("muted_until")?,
                    is_pinned: row.try_get("is_pinned")?,
                    pinned_at: row.try_get("pinned_at")?,
                    is_archived: row.try_get("is_archived")?,
                    archived_at: row.try_get("archived_at")?,
                    joined_at: row.try_get("joined_at")?,
                    left_at: row.try_get("left_at")?,
                };
                Ok(ConversationSummary {
                    conversation,
                    participant,
                    unread_count: row.try_get("unread_count")?,
                })
            })
            .collect()
    }

    async fn append_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        new: NewMessage,
    ) -> AppResult<Message> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "INSERT INTO messages (conversation_id, sender_id, kind, content, metadata, \
                                   attachments, reply_to_id, forwarded_from_id, expires_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(conversation_id)
        .bind(sender_id)
        .bind(new.kind.as_str())
        .bind(&new.content)
        .bind(Json(&new.metadata))
        .bind(Json(&new.attachments))
        .bind(new.reply_to_id)
        .bind(new.forwarded_from_id)
        .bind(new.expires_at)
        .fetch_one(&mut *tx)
        .await?;
        let message = message_from_row(&row)?;

        sqlx::query(
            "UPDATE conversations \
             SET last_message_id = $2, last_message_at = $3, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(conversation_id)
        .bind(message.id)
        .bind(message.created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM message_drafts WHERE conversation_id = $1 AND user_id = $2")
            .bind(conversation_id)
            .bind(sender_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(message)
    }

    async fn message(&self, id: i64) -> AppResult<Option<Message>> {
        let row = sqlx::query(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn list_messages(
        &self,
        conversation_id: Uuid,
        requester: Uuid,
        query: MessageQuery,
    ) -> AppResult<Vec<Message>> {
        let limit = if query.limit <= 0 { 50 } else { query.limit };
        let rows = if let Some(after) = query.after_id {
            sqlx::query(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages \
                 WHERE conversation_id = $1 \
                   AND NOT jsonb_exists(deleted_for, $2::text) \
                   AND id > $3 AND ($4::bigint IS NULL OR id < $4) \
                 ORDER BY id ASC LIMIT $5"
            ))
            .bind(conversation_id)
            .bind(requester.to_string())
            .bind(after)
            .bind(query.before_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            let mut rows = sqlx::query(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages \
                 WHERE conversation_id = $1 \
                   AND NOT jsonb_exists(deleted_for, $2::text) \
                   AND ($3::bigint IS NULL OR id < $3) \
                 ORDER BY id DESC LIMIT $4"
            ))
            .bind(conversation_id)
            .bind(requester.to_string())
            .bind(query.before_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            rows.reverse();
            rows
        };

        rows.iter()
            .map(|row| {
                let mut msg = message_from_row(row)?;
                msg.deleted_for.clear();
                Ok(msg)
            })
            .collect()
    }

    async fn apply_read_receipts(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        message_ids: &[i64],
    ) -> AppResult<ReadOutcome> {
        let mut tx = self.pool.begin().await?;

        // Only receipts for someone else's messages in this conversation
        // count; duplicates fall out via ON CONFLICT.
        let rows = sqlx::query(
            "INSERT INTO message_read_receipts (message_id, user_id) \
             SELECT m.id, $2 FROM messages m \
             WHERE m.id = ANY($3) AND m.conversation_id = $1 AND m.sender_id <> $2 \
             ON CONFLICT (message_id, user_id) DO NOTHING \
             RETURNING message_id",
        )
        .bind(conversation_id)
        .bind(user_id)
        .bind(message_ids)
        .fetch_all(&mut *tx)
        .await?;

        let mut newly_read: Vec<i64> = rows
            .iter()
            .map(|row| row.try_get("message_id").map_err(AppError::from))
            .collect::<AppResult<_>>()?;
        newly_read.sort_unstable();

        if let Some(&max_id) = newly_read.last() {
            // GREATEST keeps the pointer monotonic under concurrent acks.
            sqlx::query(
                "UPDATE conversation_participants \
                 SET last_read_message_id = GREATEST(COALESCE(last_read_message_id, 0), $3), \
                     last_read_at = NOW() \
                 WHERE conversation_id = $1 AND user_id = $2",
            )
            .bind(conversation_id)
            .bind(user_id)
            .bind(max_id)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "UPDATE messages \
                 SET status = 'read', delivered_at = COALESCE(delivered_at, NOW()) \
                 WHERE id = ANY($1) AND status IN ('sent', 'delivered')",
            )
            .bind(&newly_read)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(ReadOutcome { newly_read })
    }

    async fn delete_for_everyone(&self, message_id: i64) -> AppResult<Message> {
        let row = sqlx::query(&format!(
            "UPDATE messages \
             SET content = NULL, attachments = '[]', metadata = '{{\"kind\":\"none\"}}', \
                 is_deleted = TRUE, deleted_at = NOW() \
             WHERE id = $1 \
             RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AppError::NotFound("message"))?;
        message_from_row(&row)
    }

    async fn delete_for_user(&self, message_id: i64, user_id: Uuid) -> AppResult<()> {
        let result = sqlx::query(
            "UPDATE messages \
             SET deleted_for = deleted_for || to_jsonb($2::text) \
             WHERE id = $1 AND NOT jsonb_exists(deleted_for, $2::text)",
        )
        .bind(message_id)
        .bind(user_id.to_string())
        .execute(&self.pool)
        .await?;
        // Zero rows is fine when the hide was already recorded, but the
        // message itself must exist.
        if result.rows_affected() == 0 {
            let exists = sqlx::query("SELECT 1 FROM messages WHERE id = $1")
                .bind(message_id)
                .fetch_optional(&self.pool)
                .await?;
            if exists.is_none() {
                return Err(AppError::NotFound("message"));
            }
        }
        Ok(())
    }

    async fn apply_edit(
        &self,
        message_id: i64,
        new_content: String,
        prior: EditRecord,
    ) -> AppResult<Message> {
        let row = sqlx::query(&format!(
            "UPDATE messages \
             SET content = $2, is_edited = TRUE, edited_at = NOW(), \
                 edit_history = edit_history || $3 \
             WHERE id = $1 \
             RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(message_id)
        .bind(&new_content)
        .bind(Json(&prior))
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AppError::NotFound("message"))?;
        message_from_row(&row)
    }

    async fn toggle_reaction(
        &self,
        message_id: i64,
        user_id: Uuid,
        symbol: &str,
    ) -> AppResult<ReactionAction> {
        let mut tx = self.pool.begin().await?;

        let removed = sqlx::query(
            "DELETE FROM message_reactions \
             WHERE message_id = $1 AND user_id = $2 AND symbol = $3",
        )
        .bind(message_id)
        .bind(user_id)
        .bind(symbol)
        .execute(&mut *tx)
        .await?;

        let action = if removed.rows_affected() > 0 {
            ReactionAction::Removed
        } else {
            sqlx::query(
                "INSERT INTO message_reactions (message_id, user_id, symbol) \
                 VALUES ($1, $2, $3)",
            )
            .bind(message_id)
            .bind(user_id)
            .bind(symbol)
            .execute(&mut *tx)
            .await?;
            ReactionAction::Added
        };

        tx.commit().await?;
        Ok(action)
    }

    async fn reactions(&self, message_id: i64) -> AppResult<Vec<Reaction>> {
        let rows = sqlx::query(
            "SELECT message_id, user_id, symbol, created_at FROM message_reactions \
             WHERE message_id = $1 ORDER BY created_at",
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(Reaction {
                    message_id: row.try_get("message_id")?,
                    user_id: row.try_get("user_id")?,
                    symbol: row.try_get("symbol")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn save_draft(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        content: String,
        reply_to_id: Option<i64>,
    ) -> AppResult<Draft> {
        let row = sqlx::query(
            "INSERT INTO message_drafts (conversation_id, user_id, content, reply_to_id) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (conversation_id, user_id) \
             DO UPDATE SET content = $3, reply_to_id = $4, updated_at = NOW() \
             RETURNING conversation_id, user_id, content, reply_to_id, updated_at",
        )
        .bind(conversation_id)
        .bind(user_id)
        .bind(&content)
        .bind(reply_to_id)
        .fetch_one(&self.pool)
        .await?;
        draft_from_row(&row)
    }

    async fn draft(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<Option<Draft>> {
        let row = sqlx::query(
            "SELECT conversation_id, user_id, content, reply_to_id, updated_at \
             FROM message_drafts WHERE conversation_id = $1 AND user_id = $2",
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(draft_from_row).transpose()
    }

    async fn toggle_pin(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<Participant> {
        let row = sqlx::query(&format!(
            "UPDATE conversation_participants \
             SET is_pinned = NOT is_pinned, \
                 pinned_at = CASE WHEN is_pinned THEN NULL ELSE NOW() END \
             WHERE conversation_id = $1 AND user_id = $2 \
             RETURNING {PARTICIPANT_COLUMNS}"
        ))
        .bind(conversation_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AppError::NotFound("participant"))?;
        participant_from_row(&row)
    }

    async fn toggle_mute(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        muted_until: Option<DateTime<Utc>>,
    ) -> AppResult<Participant> {
        let row = sqlx::query(&format!(
            "UPDATE conversation_participants \
             SET is_muted = NOT is_muted, \
                 muted_until = CASE WHEN is_muted THEN NULL ELSE $3 END \
             WHERE conversation_id = $1 AND user_id = $2 \
             RETURNING {PARTICIPANT_COLUMNS}"
        ))
        .bind(conversation_id)
        .bind(user_id)
        .bind(muted_until)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AppError::NotFound("participant"))?;
        participant_from_row(&row)
    }

    async fn toggle_archive(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<Participant> {
        let row = sqlx::query(&format!(
            "UPDATE conversation_participants \
             SET is_archived = NOT is_archived, \
                 archived_at = CASE WHEN is_archived THEN NULL ELSE NOW() END \
             WHERE conversation_id = $1 AND user_id = $2 \
             RETURNING {PARTICIPANT_COLUMNS}"
        ))
        .bind(conversation_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AppError::NotFound("participant"))?;
        participant_from_row(&row)
    }

    async fn insert_call(&self, call: CallRecord) -> AppResult<CallRecord> {
        let row = sqlx::query(&format!(
            "INSERT INTO call_logs (conversation_id, caller_id, kind, status, started_at, \
                                    participants) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING {CALL_COLUMNS}"
        ))
        .bind(call.conversation_id)
        .bind(call.caller_id)
        .bind(call.kind.as_str())
        .bind(call.status.as_str())
        .bind(call.started_at)
        .bind(Json(&call.participants))
        .fetch_one(&self.pool)
        .await?;
        call_from_row(&row)
    }

    async fn call(&self, id: i64) -> AppResult<Option<CallRecord>> {
        let row = sqlx::query(&format!("SELECT {CALL_COLUMNS} FROM call_logs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(call_from_row).transpose()
    }

    async fn update_call(&self, call: &CallRecord) -> AppResult<()> {
        // Guarded so an ended call stays ended even under racing updates.
        sqlx::query(
            "UPDATE call_logs \
             SET status = $2, answered_at = $3, ended_at = $4, duration_seconds = $5, \
                 participants = $6 \
             WHERE id = $1 AND status <> 'ended'",
        )
        .bind(call.id)
        .bind(call.status.as_str())
        .bind(call.answered_at)
        .bind(call.ended_at)
        .bind(call.duration_seconds)
        .bind(Json(&call.participants))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn expire_messages(&self, now: DateTime<Utc>) -> AppResult<Vec<(Uuid, i64)>> {
        let rows = sqlx::query(
            "UPDATE messages \
             SET content = NULL, attachments = '[]', metadata = '{\"kind\":\"none\"}', \
                 is_deleted = TRUE, deleted_at = $1 \
             WHERE expires_at IS NOT NULL AND expires_at <= $1 AND is_deleted = FALSE \
             RETURNING conversation_id, id",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| Ok((row.try_get("conversation_id")?, row.try_get("id")?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_columns_in_schema(columns: &str, schema: &str) {
        for column in columns.split(',') {
            let column = column.trim();
            assert!(
                schema.contains(column),
                "column `{column}` is not created by the migrations"
            );
        }
    }

    // Guards the SELECT lists against drifting from the migrations without
    // needing a live database.
    #[test]
    fn column_lists_match_the_migrations() {
        let conversations = include_str!("../../migrations/0001_create_conversations.sql");
        let messages = include_str!("../../migrations/0002_create_messages.sql");
        let calls = include_str!("../../migrations/0003_create_calls.sql");

        assert_columns_in_schema(CONVERSATION_COLUMNS, conversations);
        assert_columns_in_schema(PARTICIPANT_COLUMNS, conversations);
        assert_columns_in_schema(MESSAGE_COLUMNS, messages);
        assert_columns_in_schema(CALL_COLUMNS, calls);
    }
}
