use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Replica key prefix under which message records are stored.
pub const MESSAGE_KEY_PREFIX: &str = "message/";

/// Replica key for a message id.
pub fn message_key(id: &str) -> String {
    format!("{MESSAGE_KEY_PREFIX}{id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A single message belonging to a chat.
///
/// `chat_id` is immutable after creation. Ordering within a chat is by
/// `created_at` ascending, ties broken by `id` for a total order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub user_id: String,
    pub role: Role,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial update for a message. `chat_id` and `role` cannot change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageUpdate {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    pub updated_at: DateTime<Utc>,
}
