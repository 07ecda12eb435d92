use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Opaque marker of how much remote history has been pulled. The client only
/// relies on `order` advancing monotonically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub order: i64,
    #[serde(rename = "cvrID")]
    pub cvr_id: String,
}

/// One mutation in the push request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMutation {
    #[serde(rename = "clientID")]
    pub client_id: String,
    pub id: u64,
    pub name: String,
    pub args: Value,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRequest {
    #[serde(rename = "clientGroupID")]
    pub client_group_id: String,
    pub mutations: Vec<WireMutation>,
}

/// Push response: the server has durably applied (or skipped as already
/// applied) every mutation with `id <= applied_up_to` for this client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    pub applied_up_to: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    #[serde(rename = "clientGroupID")]
    pub client_group_id: String,
    pub cookie: Option<Cookie>,
}

/// Entity-keyed patch operation in a pull response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum PatchOperation {
    #[serde(rename = "clear")]
    Clear,
    #[serde(rename = "del")]
    Delete { key: String },
    #[serde(rename = "put")]
    Put { key: String, value: Value },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullResponse {
    pub cookie: Cookie,
    pub patch: Vec<PatchOperation>,
}

/// Transport failures are uniform from the coordinator's point of view: the
/// cycle is abandoned and retried on the next sync, with no local data loss.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Server returned status {0}")]
    Status(u16),

    #[error("Failed to decode response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            TransportError::Status(status.as_u16())
        } else if e.is_decode() {
            TransportError::Decode(e.to_string())
        } else {
            TransportError::Http(e.to_string())
        }
    }
}

pub type TransportFuture<T> = Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send>>;

/// The client side of the remote authority protocol. Implementations must be
/// idempotent on push: replaying an already-applied mutation is a server-side
/// no-op, which is what makes retry-on-next-sync safe.
pub trait SyncTransport: Send + Sync + 'static {
    fn push(&self, request: PushRequest) -> TransportFuture<PushResponse>;
    fn pull(&self, request: PullRequest) -> TransportFuture<PullResponse>;
}
