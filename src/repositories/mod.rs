pub mod error;
pub mod in_memory_repository;
pub mod replica_repository;
pub mod replica_sqlite_repository;

pub use error::{RepositoryError, RepositoryResult};
pub use in_memory_repository::InMemoryReplicaRepository;
pub use replica_repository::{BoxFuture, ReplicaRepository, ReplicaSnapshot};
pub use replica_sqlite_repository::ReplicaSqliteRepository;

use crate::sync::{Cookie, MutationRecord, PatchOperation};

/// Work items for the single persistence writer task. Routing every write
/// through one queue keeps disk state in the same order as replica state:
/// a pending insert can never race its own confirmation delete.
#[derive(Debug, Clone)]
pub enum PersistCommand {
    SavePending(MutationRecord),
    RemovePendingUpTo(u64),
    SaveBase {
        ops: Vec<PatchOperation>,
        cookie: Cookie,
    },
}
