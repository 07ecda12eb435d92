use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::models::active_model::active_model_key;
use crate::models::chat::chat_key;
use crate::models::message::message_key;
use crate::models::{ActiveModel, ActiveModelUpdate, Chat, ChatUpdate, ForkChatArgs, Message, MessageUpdate};
use crate::replica::WriteTx;

/// Arguments for the delete mutations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteArgs {
    pub id: String,
}

/// The closed set of named optimistic mutations. Each variant is a pure
/// function of (current replica state, arguments): it is applied locally the
/// moment it is enqueued and replayed identically by the server, so it must
/// be deterministic and free of side effects outside the replica.
///
/// Serialized as `{"name": ..., "args": ...}`, matching the wire format the
/// remote authority's mutation parser expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "args")]
pub enum Mutation {
    #[serde(rename = "createChat")]
    CreateChat(Chat),
    #[serde(rename = "updateChat")]
    UpdateChat(ChatUpdate),
    #[serde(rename = "deleteChat")]
    DeleteChat(DeleteArgs),
    #[serde(rename = "forkChat")]
    ForkChat(ForkChatArgs),
    #[serde(rename = "createMessage")]
    CreateMessage(Message),
    #[serde(rename = "updateMessage")]
    UpdateMessage(MessageUpdate),
    #[serde(rename = "deleteMessage")]
    DeleteMessage(DeleteArgs),
    #[serde(rename = "createActiveModel")]
    CreateActiveModel(ActiveModel),
    #[serde(rename = "updateActiveModel")]
    UpdateActiveModel(ActiveModelUpdate),
    #[serde(rename = "deleteActiveModel")]
    DeleteActiveModel(DeleteArgs),
}

impl Mutation {
    pub fn name(&self) -> &'static str {
        match self {
            Mutation::CreateChat(_) => "createChat",
            Mutation::UpdateChat(_) => "updateChat",
            Mutation::DeleteChat(_) => "deleteChat",
            Mutation::ForkChat(_) => "forkChat",
            Mutation::CreateMessage(_) => "createMessage",
            Mutation::UpdateMessage(_) => "updateMessage",
            Mutation::DeleteMessage(_) => "deleteMessage",
            Mutation::CreateActiveModel(_) => "createActiveModel",
            Mutation::UpdateActiveModel(_) => "updateActiveModel",
            Mutation::DeleteActiveModel(_) => "deleteActiveModel",
        }
    }

    /// Apply this mutation to the replica. Update mutators tolerate a missing
    /// previous record by treating the mutation as a create with defaults:
    /// an optimistic local update may race ahead of a not-yet-pulled create.
    pub fn apply(&self, tx: &mut WriteTx<'_>) {
        match self {
            Mutation::CreateChat(chat) => set_row(tx, chat_key(&chat.id), chat),
            Mutation::UpdateChat(update) => {
                let mut chat = read_row::<Chat>(tx, &chat_key(&update.id)).unwrap_or_else(|| {
                    Chat::new(update.id.clone(), String::new(), None, update.updated_at)
                });
                if let Some(title) = &update.title {
                    chat.title = Some(title.clone());
                }
                if let Some(pinned) = update.pinned {
                    chat.pinned = pinned;
                    chat.pinned_at = pinned.then_some(update.updated_at);
                }
                if let Some(archived) = update.archived {
                    chat.archived = archived;
                }
                chat.version += 1;
                // updated_at is monotonic non-decreasing across mutations.
                chat.updated_at = chat.updated_at.max(update.updated_at);
                set_row(tx, chat_key(&chat.id), &chat);
            }
            Mutation::DeleteChat(args) => tx.del(&chat_key(&args.id)),
            Mutation::ForkChat(args) => {
                let chat = Chat {
                    id: args.new_id.clone(),
                    user_id: args.user_id.clone(),
                    title: Some(args.title.clone()),
                    pinned: false,
                    pinned_at: None,
                    archived: false,
                    forked: true,
                    version: 1,
                    created_at: args.time,
                    updated_at: args.time,
                };
                set_row(tx, chat_key(&chat.id), &chat);
                for msg in &args.msgs {
                    let copied = Message {
                        chat_id: args.new_id.clone(),
                        user_id: args.user_id.clone(),
                        version: 1,
                        ..msg.clone()
                    };
                    set_row(tx, message_key(&copied.id), &copied);
                }
            }
            Mutation::CreateMessage(message) => set_row(tx, message_key(&message.id), message),
            Mutation::UpdateMessage(update) => {
                let key = message_key(&update.id);
                let Some(mut message) = read_row::<Message>(tx, &key) else {
                    // Nothing sensible to default a chat-less message to;
                    // drop it rather than fabricate an orphan row.
                    warn!(id = %update.id, "updateMessage for unknown message, skipping");
                    return;
                };
                if let Some(body) = &update.body {
                    message.body = body.clone();
                }
                if let Some(reasoning) = &update.reasoning {
                    message.reasoning = Some(reasoning.clone());
                }
                message.version += 1;
                message.updated_at = message.updated_at.max(update.updated_at);
                set_row(tx, key, &message);
            }
            Mutation::DeleteMessage(args) => tx.del(&message_key(&args.id)),
            Mutation::CreateActiveModel(model) => set_row(tx, active_model_key(&model.id), model),
            Mutation::UpdateActiveModel(update) => {
                let key = active_model_key(&update.id);
                let mut model = read_row::<ActiveModel>(tx, &key).unwrap_or(ActiveModel {
                    id: update.id.clone(),
                    provider: String::new(),
                    model: String::new(),
                    reasoning: None,
                    created_at: update.updated_at,
                    updated_at: update.updated_at,
                });
                model.provider = update.provider.clone();
                model.model = update.model.clone();
                model.reasoning = update.reasoning;
                model.updated_at = model.updated_at.max(update.updated_at);
                set_row(tx, key, &model);
            }
            Mutation::DeleteActiveModel(args) => tx.del(&active_model_key(&args.id)),
        }
    }
}

fn read_row<T: serde::de::DeserializeOwned>(tx: &WriteTx<'_>, key: &str) -> Option<T> {
    tx.get(key)
        .and_then(|value| serde_json::from_value(value.clone()).ok())
}

fn set_row<T: Serialize>(tx: &mut WriteTx<'_>, key: String, value: &T) {
    match serde_json::to_value(value) {
        Ok(row) => tx.set(key, row),
        Err(error) => warn!(%key, %error, "Failed to serialize replica row, dropping write"),
    }
}

/// A mutation awaiting server confirmation: the client-assigned sequence
/// position, the mutation itself, and when it was enqueued. Lives in the
/// mutation log until a pull supersedes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRecord {
    pub id: u64,
    pub mutation: Mutation,
    pub timestamp: DateTime<Utc>,
}

impl MutationRecord {
    /// Flatten into the wire shape the push endpoint expects.
    pub fn to_wire(&self, client_id: &str) -> Result<super::transport::WireMutation, serde_json::Error> {
        let tagged = serde_json::to_value(&self.mutation)?;
        let args = tagged.get("args").cloned().unwrap_or(Value::Null);
        Ok(super::transport::WireMutation {
            client_id: client_id.to_string(),
            id: self.id,
            name: self.mutation.name().to_string(),
            args,
            timestamp: self.timestamp.timestamp_millis() as f64,
        })
    }
}
