use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Draft {
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub content: String,
    pub reply_to_id: Option<i64>,
    pub updated_at: DateTime<Utc>,
}
