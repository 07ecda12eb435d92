use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::log::MutationLog;
use super::transport::{PullRequest, PushRequest, SyncTransport, TransportError};
use crate::replica::ReplicaStore;
use crate::repositories::PersistCommand;

#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error("push failed: {0}")]
    Push(#[source] TransportError),

    #[error("pull failed: {0}")]
    Pull(#[source] TransportError),

    #[error("mutation could not be encoded for push: {0}")]
    Encode(String),
}

#[derive(Default)]
struct SyncState {
    in_flight: bool,
    queued: bool,
}

/// Orchestrates push/pull cycles against the remote authority.
///
/// A cycle is: push unconfirmed mutations in FIFO order, pull everything
/// since the last cookie, prune the records the push confirmed, then rebase
/// the replica (new base + replay of whatever is still unconfirmed).
/// Concurrent `sync()` calls coalesce into at most one in-flight cycle plus
/// one queued follow-up.
pub struct SyncCoordinator {
    replica: Arc<ReplicaStore>,
    log: Arc<MutationLog>,
    transport: Arc<dyn SyncTransport>,
    client_group_id: String,
    client_id: String,
    persist_tx: mpsc::UnboundedSender<PersistCommand>,
    state: Mutex<SyncState>,
}

impl SyncCoordinator {
    pub fn new(
        replica: Arc<ReplicaStore>,
        log: Arc<MutationLog>,
        transport: Arc<dyn SyncTransport>,
        client_group_id: String,
        client_id: String,
        persist_tx: mpsc::UnboundedSender<PersistCommand>,
    ) -> Self {
        Self {
            replica,
            log,
            transport,
            client_group_id,
            client_id,
            persist_tx,
            state: Mutex::new(SyncState::default()),
        }
    }

    /// Run a sync cycle. Safe to call from anywhere at any time: if a cycle
    /// is already in flight this only queues a single follow-up and returns.
    pub async fn sync(&self) -> Result<(), SyncError> {
        {
            let mut state = self.state.lock();
            if state.in_flight {
                state.queued = true;
                debug!("Sync already in flight, queued a follow-up cycle");
                return Ok(());
            }
            state.in_flight = true;
        }

        loop {
            let result = self.run_cycle().await;
            let mut state = self.state.lock();
            if state.queued {
                state.queued = false;
                drop(state);
                continue;
            }
            state.in_flight = false;
            return result;
        }
    }

    async fn run_cycle(&self) -> Result<(), SyncError> {
        // Push phase. A failure leaves every record queued for the next sync.
        let pending = self.log.pending();
        let mut applied_up_to = None;
        if !pending.is_empty() {
            let mutations = pending
                .iter()
                .map(|record| record.to_wire(&self.client_id))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| SyncError::Encode(e.to_string()))?;
            let count = mutations.len();
            let response = self
                .transport
                .push(PushRequest {
                    client_group_id: self.client_group_id.clone(),
                    mutations,
                })
                .await
                .map_err(|e| {
                    warn!(error = %e, pending = count, "Push failed, mutations stay queued");
                    SyncError::Push(e)
                })?;
            debug!(count, applied_up_to = response.applied_up_to, "Pushed mutations");
            applied_up_to = Some(response.applied_up_to);
        }

        // Pull phase. A failure leaves the replica at its last known-good
        // cookie; the next wake-up retries.
        let response = self
            .transport
            .pull(PullRequest {
                client_group_id: self.client_group_id.clone(),
                cookie: self.replica.cookie(),
            })
            .await
            .map_err(|e| {
                warn!(error = %e, "Pull failed, replica stays at last cookie");
                SyncError::Pull(e)
            })?;

        // The pulled cookie supersedes everything the push confirmed.
        if let Some(watermark) = applied_up_to {
            self.log.prune_confirmed(watermark);
        }

        let replay = self.log.pending();
        self.replica
            .rebase(&response.patch, response.cookie.clone(), &replay);

        if self
            .persist_tx
            .send(PersistCommand::SaveBase {
                ops: response.patch,
                cookie: response.cookie.clone(),
            })
            .is_err()
        {
            warn!("Persistence writer is gone, pulled state not saved to disk");
        }

        info!(
            cookie_order = response.cookie.order,
            unconfirmed = replay.len(),
            "Sync cycle complete"
        );
        Ok(())
    }
}
