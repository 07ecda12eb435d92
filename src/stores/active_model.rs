use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;

use crate::models::ActiveModel;
use crate::models::active_model::ACTIVE_MODEL_KEY_PREFIX;
use crate::replica::{ReplicaStore, SubscriptionHandle};

/// Live projection of the client-wide active model selection (at most one).
pub struct ActiveModelStore {
    data_tx: watch::Sender<Option<ActiveModel>>,
    subscription: Mutex<Option<SubscriptionHandle>>,
}

impl ActiveModelStore {
    pub fn new() -> Arc<Self> {
        let (data_tx, _) = watch::channel(None);
        Arc::new(Self {
            data_tx,
            subscription: Mutex::new(None),
        })
    }

    pub fn sync(&self, replica: &ReplicaStore) {
        self.cleanup(replica);
        debug!("Syncing active model");

        let data_tx = self.data_tx.clone();
        let handle = replica.subscribe(
            Box::new(|view| {
                view.scan_prefix(ACTIVE_MODEL_KEY_PREFIX)
                    .map(|(_, value)| value.clone())
                    .next()
                    .unwrap_or(Value::Null)
            }),
            Box::new(move |value| {
                let model: Option<ActiveModel> = serde_json::from_value(value.clone()).ok();
                let _ = data_tx.send(model);
            }),
        );
        *self.subscription.lock() = Some(handle);
    }

    pub fn cleanup(&self, replica: &ReplicaStore) {
        if let Some(handle) = self.subscription.lock().take() {
            debug!("Cleaning up active model subscription");
            replica.unsubscribe(handle);
            let _ = self.data_tx.send(None);
        }
    }

    /// Current selection, if any. Drives the create-vs-update split when the
    /// user picks a model.
    pub fn current(&self) -> Option<ActiveModel> {
        self.data_tx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Option<ActiveModel>> {
        self.data_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::models::{ActiveModelUpdate, ReasoningEffort};
    use crate::sync::Mutation;

    #[test]
    fn reflects_create_then_update() {
        let replica = ReplicaStore::new();
        let store = ActiveModelStore::new();
        store.sync(&replica);
        assert!(store.current().is_none());

        let now = Utc::now();
        let model = ActiveModel {
            id: "am1".into(),
            provider: "openai".into(),
            model: "o3".into(),
            reasoning: Some(ReasoningEffort::High),
            created_at: now,
            updated_at: now,
        };
        replica.apply(|tx| Mutation::CreateActiveModel(model).apply(tx));
        assert_eq!(store.current().unwrap().model, "o3");

        replica.apply(|tx| {
            Mutation::UpdateActiveModel(ActiveModelUpdate {
                id: "am1".into(),
                provider: "openai".into(),
                model: "gpt-4.1".into(),
                reasoning: None,
                updated_at: Utc::now(),
            })
            .apply(tx)
        });
        let current = store.current().unwrap();
        assert_eq!(current.model, "gpt-4.1");
        assert_eq!(current.reasoning, None);
    }
}
