//! Reconciliation core for a local-first chat client.
//!
//! All reads come from a durable local replica; all writes are optimistic
//! mutations that apply locally first and are replayed by the remote
//! authority later. A sync coordinator exchanges mutations for authoritative
//! patches over HTTP, a server-sent-events channel delivers sync pokes and
//! streamed assistant responses, and projection stores turn replica rows into
//! ready-to-render data behind watch channels.
//!
//! [`session::ChatSession`] wires all of it together for one signed-in user.

pub mod models;
pub mod replica;
pub mod repositories;
pub mod session;
pub mod sse;
pub mod stores;
pub mod stream;
pub mod sync;

pub use models::{ActiveModel, Chat, Message, ReasoningEffort, Role};
pub use replica::ReplicaStore;
pub use session::{ChatSession, SessionConfig, SessionError};
pub use sse::ConnectionState;
pub use stores::{ActiveModelStore, ChatsStore, MessagesStore};
pub use stream::{PendingResponse, StreamPhase, StreamReconciler};
