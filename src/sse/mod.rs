pub mod client;
pub mod parser;
pub mod registry;

pub use client::{ConnectionState, SseClient};
pub use registry::{ListenerHandle, ListenerRegistry};

/// Wake-up event: "something changed server-side, pull now". Carries no data
/// the client relies on; missed wake-ups are recovered by the next pull.
pub const POKE_EVENT: &str = "replicache/poke";

/// Assistant-response stream lifecycle events.
pub const STREAM_CHUNK_EVENT: &str = "chat-stream-chunk";
pub const STREAM_DONE_EVENT: &str = "chat-stream-done";
pub const STREAM_ERROR_EVENT: &str = "chat-stream-error";
pub const STREAM_EXIT_EVENT: &str = "chat-stream-exit";
