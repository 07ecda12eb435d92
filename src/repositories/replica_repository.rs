use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use serde_json::Value;

use super::error::RepositoryResult;
use crate::sync::{Cookie, MutationRecord, PatchOperation};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Everything needed to resume a session offline: the confirmed row image,
/// the cookie it was pulled at, the optimistic mutations that had not been
/// confirmed when the previous session ended, and the highest sequence id
/// ever assigned by this client.
///
/// `last_mutation_id` must survive pruning: the authority dedupes by
/// (client, id) forever, so a restarted session reusing a confirmed id would
/// have its mutations silently skipped server-side.
#[derive(Debug, Clone, Default)]
pub struct ReplicaSnapshot {
    pub rows: BTreeMap<String, Value>,
    pub cookie: Option<Cookie>,
    pub pending: Vec<MutationRecord>,
    pub last_mutation_id: u64,
}

/// Storage interface for the durable replica.
///
/// The confirmed base and the pending log are written through separate calls
/// so a crash between a patch write and a prune leaves the store consistent:
/// a pending mutation that was already confirmed simply gets pushed again,
/// which the authority deduplicates by sequence number.
pub trait ReplicaRepository: Send + Sync + 'static {
    /// Load the full snapshot at session start.
    fn load(&self) -> BoxFuture<'static, RepositoryResult<ReplicaSnapshot>>;

    /// Persist one newly enqueued optimistic mutation.
    fn save_pending(&self, record: MutationRecord) -> BoxFuture<'static, RepositoryResult<()>>;

    /// Remove confirmed mutations (`id <= applied_up_to`).
    fn remove_pending_up_to(&self, applied_up_to: u64) -> BoxFuture<'static, RepositoryResult<()>>;

    /// Apply a pulled patch to the confirmed row image and record the cookie
    /// it corresponds to. The two must land atomically.
    fn apply_patch(
        &self,
        ops: Vec<PatchOperation>,
        cookie: Cookie,
    ) -> BoxFuture<'static, RepositoryResult<()>>;
}
