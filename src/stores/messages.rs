use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;

use crate::models::Message;
use crate::models::message::MESSAGE_KEY_PREFIX;
use crate::replica::{ReadView, ReplicaStore, SubscriptionHandle};

/// Live projection of one chat's messages, sorted by `created_at` ascending
/// (ties broken by id, so the order is total and stable under replay).
///
/// The store is scoped to a single chat at a time via [`MessagesStore::sync`];
/// navigating away re-scopes or cleans it up. The scope is also the guard for
/// the optimistic [`MessagesStore::append_message`] fast path.
pub struct MessagesStore {
    data_tx: watch::Sender<Vec<Message>>,
    synced_chat_id: Mutex<Option<String>>,
    subscription: Mutex<Option<SubscriptionHandle>>,
}

fn list_messages_for_chat(view: &ReadView<'_>, chat_id: &str) -> Vec<Message> {
    let mut messages: Vec<Message> = view
        .scan_prefix(MESSAGE_KEY_PREFIX)
        .filter_map(|(_, value)| serde_json::from_value::<Message>(value.clone()).ok())
        .filter(|message| message.chat_id == chat_id)
        .collect();
    messages.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    messages
}

impl MessagesStore {
    pub fn new() -> Arc<Self> {
        let (data_tx, _) = watch::channel(Vec::new());
        Arc::new(Self {
            data_tx,
            synced_chat_id: Mutex::new(None),
            subscription: Mutex::new(None),
        })
    }

    /// Scope the projection to `chat_id` and register the live query.
    pub fn sync(&self, replica: &ReplicaStore, chat_id: &str) {
        self.cleanup(replica);
        debug!(chat_id, "Syncing messages");

        *self.synced_chat_id.lock() = Some(chat_id.to_string());
        let data_tx = self.data_tx.clone();
        let scope = chat_id.to_string();
        let handle = replica.subscribe(
            Box::new(move |view| {
                serde_json::to_value(list_messages_for_chat(view, &scope))
                    .unwrap_or(Value::Array(Vec::new()))
            }),
            Box::new(move |value| {
                let messages: Vec<Message> =
                    serde_json::from_value(value.clone()).unwrap_or_default();
                let _ = data_tx.send(messages);
            }),
        );
        *self.subscription.lock() = Some(handle);
    }

    pub fn cleanup(&self, replica: &ReplicaStore) {
        if let Some(handle) = self.subscription.lock().take() {
            debug!("Cleaning up message subscription");
            replica.unsubscribe(handle);
        }
        *self.synced_chat_id.lock() = None;
        let _ = self.data_tx.send(Vec::new());
    }

    /// Optimistic, locally-synthesized append. Ignored when the message
    /// targets a chat this store is not currently scoped to, which prevents
    /// cross-conversation leakage after navigating away mid-request.
    pub fn append_message(&self, message: Message) {
        let synced = self.synced_chat_id.lock();
        if synced.as_deref() == Some(message.chat_id.as_str()) {
            debug!(chat_id = %message.chat_id, "Optimistically appending message");
            self.data_tx.send_modify(|data| data.push(message));
        } else {
            debug!(
                chat_id = %message.chat_id,
                synced = ?*synced,
                "Ignoring optimistic append for non-synced chat"
            );
        }
    }

    pub fn synced_chat_id(&self) -> Option<String> {
        self.synced_chat_id.lock().clone()
    }

    /// Current projection snapshot.
    pub fn data(&self) -> Vec<Message> {
        self.data_tx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Vec<Message>> {
        self.data_tx.subscribe()
    }
}
