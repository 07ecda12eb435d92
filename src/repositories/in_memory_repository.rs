use std::sync::Arc;

use parking_lot::Mutex;

use super::error::RepositoryResult;
use super::replica_repository::{BoxFuture, ReplicaRepository, ReplicaSnapshot};
use crate::sync::{Cookie, MutationRecord, PatchOperation};

/// In-memory replica storage. Useful for testing and for sessions that opt
/// out of durability.
#[derive(Clone, Default)]
pub struct InMemoryReplicaRepository {
    state: Arc<Mutex<ReplicaSnapshot>>,
}

impl InMemoryReplicaRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReplicaRepository for InMemoryReplicaRepository {
    fn load(&self) -> BoxFuture<'static, RepositoryResult<ReplicaSnapshot>> {
        let state = self.state.clone();
        Box::pin(async move { Ok(state.lock().clone()) })
    }

    fn save_pending(&self, record: MutationRecord) -> BoxFuture<'static, RepositoryResult<()>> {
        let state = self.state.clone();
        Box::pin(async move {
            let mut state = state.lock();
            state.last_mutation_id = state.last_mutation_id.max(record.id);
            state.pending.retain(|r| r.id != record.id);
            state.pending.push(record);
            state.pending.sort_by_key(|r| r.id);
            Ok(())
        })
    }

    fn remove_pending_up_to(&self, applied_up_to: u64) -> BoxFuture<'static, RepositoryResult<()>> {
        let state = self.state.clone();
        Box::pin(async move {
            state.lock().pending.retain(|r| r.id > applied_up_to);
            Ok(())
        })
    }

    fn apply_patch(
        &self,
        ops: Vec<PatchOperation>,
        cookie: Cookie,
    ) -> BoxFuture<'static, RepositoryResult<()>> {
        let state = self.state.clone();
        Box::pin(async move {
            let mut state = state.lock();
            for op in ops {
                match op {
                    PatchOperation::Clear => state.rows.clear(),
                    PatchOperation::Delete { key } => {
                        state.rows.remove(&key);
                    }
                    PatchOperation::Put { key, value } => {
                        state.rows.insert(key, value);
                    }
                }
            }
            state.cookie = Some(cookie);
            Ok(())
        })
    }
}
