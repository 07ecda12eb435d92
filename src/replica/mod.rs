pub mod store;

pub use store::{ReadView, ReplicaStore, SubscriptionHandle, WriteTx};
