use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, warn};

use super::mutation::{Mutation, MutationRecord};
use crate::replica::ReplicaStore;
use crate::repositories::PersistCommand;

struct LogInner {
    next_id: u64,
    pending: VecDeque<MutationRecord>,
}

/// The ordered queue of optimistic mutations awaiting server confirmation.
///
/// `enqueue` applies the mutator to the replica synchronously (the optimistic
/// effect is visible to all subscriptions before the call returns), records
/// the mutation for the next push, hands it to the persistence writer, and
/// wakes the sync scheduler. Records survive push failures untouched and are
/// only removed once a pull supersedes them.
pub struct MutationLog {
    replica: Arc<ReplicaStore>,
    inner: Mutex<LogInner>,
    persist_tx: mpsc::UnboundedSender<PersistCommand>,
    sync_notify: Arc<Notify>,
}

impl MutationLog {
    pub fn new(
        replica: Arc<ReplicaStore>,
        persist_tx: mpsc::UnboundedSender<PersistCommand>,
        sync_notify: Arc<Notify>,
    ) -> Self {
        Self {
            replica,
            inner: Mutex::new(LogInner {
                next_id: 1,
                pending: VecDeque::new(),
            }),
            persist_tx,
            sync_notify,
        }
    }

    /// Append a mutation, apply it optimistically, and schedule a push.
    /// Returns the client-assigned sequence position.
    pub fn enqueue(&self, mutation: Mutation) -> u64 {
        let record = {
            let mut inner = self.inner.lock();
            let record = MutationRecord {
                id: inner.next_id,
                mutation,
                timestamp: Utc::now(),
            };
            inner.next_id += 1;
            inner.pending.push_back(record.clone());

            // Apply while still holding the log lock so mutations hit the
            // replica in enqueue order.
            self.replica.apply(|tx| record.mutation.apply(tx));
            record
        };

        debug!(id = record.id, name = record.mutation.name(), "Enqueued mutation");

        if self
            .persist_tx
            .send(PersistCommand::SavePending(record.clone()))
            .is_err()
        {
            warn!(id = record.id, "Persistence writer is gone, pending mutation is memory-only");
        }
        self.sync_notify.notify_one();
        record.id
    }

    /// Snapshot of the unconfirmed records in FIFO order.
    pub fn pending(&self) -> Vec<MutationRecord> {
        self.inner.lock().pending.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().pending.is_empty()
    }

    /// Drop records the server has confirmed (`id <= applied_up_to`).
    /// Returns how many were pruned.
    pub fn prune_confirmed(&self, applied_up_to: u64) -> usize {
        let pruned = {
            let mut inner = self.inner.lock();
            let before = inner.pending.len();
            inner.pending.retain(|record| record.id > applied_up_to);
            before - inner.pending.len()
        };
        if pruned > 0 {
            debug!(pruned, applied_up_to, "Pruned confirmed mutations");
            if self
                .persist_tx
                .send(PersistCommand::RemovePendingUpTo(applied_up_to))
                .is_err()
            {
                warn!("Persistence writer is gone, confirmed mutations not pruned on disk");
            }
        }
        pruned
    }

    /// Restore persisted unconfirmed records at session start. The caller is
    /// responsible for replaying them onto the replica.
    ///
    /// `last_mutation_id` is the persisted high-water mark of ids this client
    /// has ever assigned. The sequence must continue above it even when every
    /// record was confirmed and pruned: the authority dedupes by (client, id),
    /// so a reused id would be silently skipped server-side.
    pub fn restore(&self, records: Vec<MutationRecord>, last_mutation_id: u64) {
        let mut inner = self.inner.lock();
        let max_pending = records.iter().map(|r| r.id).max().unwrap_or(0);
        inner.next_id = last_mutation_id.max(max_pending) + 1;
        inner.pending = records.into();
    }
}
