use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::message::Message;

/// Replica key prefix under which chat records are stored.
pub const CHAT_KEY_PREFIX: &str = "chat/";

/// Replica key for a chat id.
pub fn chat_key(id: &str) -> String {
    format!("{CHAT_KEY_PREFIX}{id}")
}

/// A single conversation, as held in the local replica.
///
/// Invariants maintained by the mutators:
/// - `pinned_at` is `Some` if and only if `pinned` is true;
/// - `updated_at` never moves backwards across mutations on the same chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    pub user_id: String,
    pub title: Option<String>,
    pub pinned: bool,
    pub pinned_at: Option<DateTime<Utc>>,
    pub archived: bool,
    pub forked: bool,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Chat {
    /// Fresh chat with defaults, client-generated id.
    pub fn new(id: String, user_id: String, title: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            user_id,
            title,
            pinned: false,
            pinned_at: None,
            archived: false,
            forked: false,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update for a chat. Absent fields keep their previous value.
///
/// `pinned_at` is derived from `pinned` by the mutator (set to `updated_at`
/// when pinning, cleared when unpinning) and is deliberately not part of the
/// wire arguments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatUpdate {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived: Option<bool>,
    pub updated_at: DateTime<Utc>,
}

impl ChatUpdate {
    /// Update that only bumps the chat's `updated_at`.
    pub fn touch(id: String, updated_at: DateTime<Utc>) -> Self {
        Self {
            id,
            updated_at,
            ..Self::default()
        }
    }
}

/// Arguments for forking a chat: a new chat is created with `forked = true`
/// and the supplied snapshot of messages is copied into it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForkChatArgs {
    pub new_id: String,
    pub user_id: String,
    pub title: String,
    pub time: DateTime<Utc>,
    pub msgs: Vec<Message>,
}
