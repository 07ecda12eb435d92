pub mod coordinator;
pub mod http;
pub mod log;
pub mod mutation;
pub mod transport;

pub use coordinator::{SyncCoordinator, SyncError};
pub use http::HttpSyncTransport;
pub use log::MutationLog;
pub use mutation::{DeleteArgs, Mutation, MutationRecord};
pub use transport::{
    Cookie, PatchOperation, PullRequest, PullResponse, PushRequest, PushResponse, SyncTransport,
    TransportError, WireMutation,
};
