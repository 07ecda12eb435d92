use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;

use crate::models::Chat;
use crate::models::chat::CHAT_KEY_PREFIX;
use crate::replica::{ReadView, ReplicaStore, SubscriptionHandle};

/// Live projection of all chats, sorted by `updated_at` descending.
///
/// Presentation consumes this through [`ChatsStore::watch`]; it never reads
/// the replica directly.
pub struct ChatsStore {
    data_tx: watch::Sender<Vec<Chat>>,
    subscription: Mutex<Option<SubscriptionHandle>>,
}

fn list_chats(view: &ReadView<'_>) -> Vec<Chat> {
    let mut chats: Vec<Chat> = view
        .scan_prefix(CHAT_KEY_PREFIX)
        .filter_map(|(_, value)| serde_json::from_value(value.clone()).ok())
        .collect();
    chats.sort_by(|a, b| {
        b.updated_at
            .cmp(&a.updated_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    chats
}

impl ChatsStore {
    pub fn new() -> Arc<Self> {
        let (data_tx, _) = watch::channel(Vec::new());
        Arc::new(Self {
            data_tx,
            subscription: Mutex::new(None),
        })
    }

    /// Register the live query against the replica. Re-entrant: an existing
    /// subscription is cleaned up first.
    pub fn sync(&self, replica: &ReplicaStore) {
        self.cleanup(replica);
        debug!("Syncing chats");

        let data_tx = self.data_tx.clone();
        let handle = replica.subscribe(
            Box::new(|view| {
                serde_json::to_value(list_chats(view)).unwrap_or(Value::Array(Vec::new()))
            }),
            Box::new(move |value| {
                let chats: Vec<Chat> = serde_json::from_value(value.clone()).unwrap_or_default();
                let _ = data_tx.send(chats);
            }),
        );
        *self.subscription.lock() = Some(handle);
    }

    pub fn cleanup(&self, replica: &ReplicaStore) {
        if let Some(handle) = self.subscription.lock().take() {
            debug!("Cleaning up chat subscription");
            replica.unsubscribe(handle);
            let _ = self.data_tx.send(Vec::new());
        }
    }

    /// Current projection snapshot.
    pub fn data(&self) -> Vec<Chat> {
        self.data_tx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Vec<Chat>> {
        self.data_tx.subscribe()
    }
}
