use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::chat::ChatUpdate;
use crate::models::{Message, Role};
use crate::sse::registry::{ListenerHandle, ListenerRegistry};
use crate::sse::{STREAM_CHUNK_EVENT, STREAM_DONE_EVENT, STREAM_ERROR_EVENT, STREAM_EXIT_EVENT};
use crate::stores::MessagesStore;
use crate::sync::{Mutation, MutationLog};

/// Transient accumulation of an in-progress assistant response. Exists only
/// between stream start and the terminal event; never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingResponse {
    pub content: String,
    pub reasoning: String,
}

/// Explicit stream phase for one chat. `Idle` is the answer for any chat
/// without a live buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamPhase {
    Idle,
    Streaming {
        content: String,
        reasoning: String,
    },
}

/// SSE payloads arrive wrapped as `{"type": ..., "data": {...}}`.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct ChunkPayload {
    chat_id: String,
    #[serde(default)]
    chunk: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DonePayload {
    chat_id: String,
    #[serde(default)]
    msg_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    chat_id: String,
    error: String,
}

#[derive(Debug, Deserialize)]
struct ExitPayload {
    chat_id: String,
}

/// Per-chat state machine that merges an in-flight assistant response with
/// the persisted history.
///
/// Chunks accumulate into a transient buffer exposed through
/// [`StreamReconciler::pending_watch`]; on `done` (or `error`) the buffer is
/// converted into an ordinary mutation-log entry and deleted in the same
/// synchronous step, so the synthetic tail disappears exactly when the real
/// message becomes visible through the projection. `exit` discards the buffer
/// without creating a message.
///
/// Buffers key off chat identity, not any UI lifetime: a stream started for a
/// chat the user has navigated away from still finalizes against the replica.
pub struct StreamReconciler {
    log: Arc<MutationLog>,
    messages: Arc<MessagesStore>,
    user_id: String,
    pending: Mutex<HashMap<String, PendingResponse>>,
    pending_tx: watch::Sender<HashMap<String, PendingResponse>>,
    listeners: Mutex<Vec<ListenerHandle>>,
}

impl StreamReconciler {
    pub fn new(log: Arc<MutationLog>, messages: Arc<MessagesStore>, user_id: String) -> Arc<Self> {
        let (pending_tx, _) = watch::channel(HashMap::new());
        Arc::new(Self {
            log,
            messages,
            user_id,
            pending: Mutex::new(HashMap::new()),
            pending_tx,
            listeners: Mutex::new(Vec::new()),
        })
    }

    /// UI-facing map of chat id to pending buffer. While an entry exists for
    /// a chat, it must be rendered as the synthetic tail of that chat's
    /// message list.
    pub fn pending_watch(&self) -> watch::Receiver<HashMap<String, PendingResponse>> {
        self.pending_tx.subscribe()
    }

    pub fn phase(&self, chat_id: &str) -> StreamPhase {
        match self.pending.lock().get(chat_id) {
            Some(buffer) => StreamPhase::Streaming {
                content: buffer.content.clone(),
                reasoning: buffer.reasoning.clone(),
            },
            None => StreamPhase::Idle,
        }
    }

    /// Begin a stream for a chat: `idle -> streaming` with an empty buffer.
    /// Called by presentation when it issues the assistant request.
    pub fn start_stream(&self, chat_id: &str) {
        debug!(chat_id, "Stream started");
        self.pending
            .lock()
            .insert(chat_id.to_string(), PendingResponse::default());
        self.publish_pending();
    }

    fn handle_chunk(&self, payload: ChunkPayload) {
        {
            let mut pending = self.pending.lock();
            // A chunk for a chat without a buffer starts one implicitly:
            // the start call and the first chunk can race across the channel.
            let buffer = pending.entry(payload.chat_id).or_default();
            if let Some(chunk) = &payload.chunk {
                buffer.content.push_str(chunk);
            }
            if let Some(reasoning) = &payload.reasoning {
                buffer.reasoning.push_str(reasoning);
            }
        }
        self.publish_pending();
    }

    fn handle_done(&self, payload: DonePayload) {
        let Some(buffer) = self.pending.lock().remove(&payload.chat_id) else {
            warn!(chat_id = %payload.chat_id, "Stream done for chat with no buffer");
            return;
        };

        let now = Utc::now();
        let message = Message {
            id: payload
                .msg_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            chat_id: payload.chat_id.clone(),
            user_id: self.user_id.clone(),
            role: Role::Assistant,
            body: buffer.content,
            reasoning: (!buffer.reasoning.is_empty()).then_some(buffer.reasoning),
            version: 1,
            created_at: now,
            updated_at: now,
        };
        debug!(chat_id = %payload.chat_id, msg_id = %message.id, "Finalizing stream");

        self.messages.append_message(message.clone());
        self.log.enqueue(Mutation::CreateMessage(message));
        self.log
            .enqueue(Mutation::UpdateChat(ChatUpdate::touch(payload.chat_id, now)));
        self.publish_pending();
    }

    fn handle_error(&self, payload: ErrorPayload) {
        let removed = self.pending.lock().remove(&payload.chat_id);
        if removed.is_none() {
            warn!(chat_id = %payload.chat_id, "Stream error for chat with no buffer");
            return;
        }

        // The failed run becomes part of permanent history as a visible
        // assistant message rather than vanishing.
        let now = Utc::now();
        let message = Message {
            id: format!("{}-error-{}", payload.chat_id, now.timestamp_millis()),
            chat_id: payload.chat_id.clone(),
            user_id: self.user_id.clone(),
            role: Role::Assistant,
            body: format!("Error: {}", payload.error),
            reasoning: None,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        debug!(chat_id = %payload.chat_id, "Stream failed, recording error message");

        self.log.enqueue(Mutation::CreateMessage(message));
        self.publish_pending();
    }

    fn handle_exit(&self, payload: ExitPayload) {
        // Aborted without done/error: drop the buffer, create nothing.
        if self.pending.lock().remove(&payload.chat_id).is_some() {
            debug!(chat_id = %payload.chat_id, "Stream exited, discarding buffer");
            self.publish_pending();
        }
    }

    fn publish_pending(&self) {
        let snapshot = self.pending.lock().clone();
        let _ = self.pending_tx.send(snapshot);
    }

    /// Attach this reconciler to the push channel's listener registry.
    pub fn register(self: &Arc<Self>, registry: &ListenerRegistry) {
        let mut listeners = self.listeners.lock();

        let this = self.clone();
        listeners.push(registry.add_listener(
            STREAM_CHUNK_EVENT,
            Arc::new(move |value| {
                if let Some(payload) = parse_event::<ChunkPayload>(STREAM_CHUNK_EVENT, value) {
                    this.handle_chunk(payload);
                }
            }),
        ));

        let this = self.clone();
        listeners.push(registry.add_listener(
            STREAM_DONE_EVENT,
            Arc::new(move |value| {
                if let Some(payload) = parse_event::<DonePayload>(STREAM_DONE_EVENT, value) {
                    this.handle_done(payload);
                }
            }),
        ));

        let this = self.clone();
        listeners.push(registry.add_listener(
            STREAM_ERROR_EVENT,
            Arc::new(move |value| {
                if let Some(payload) = parse_event::<ErrorPayload>(STREAM_ERROR_EVENT, value) {
                    this.handle_error(payload);
                }
            }),
        ));

        let this = self.clone();
        listeners.push(registry.add_listener(
            STREAM_EXIT_EVENT,
            Arc::new(move |value| {
                if let Some(payload) = parse_event::<ExitPayload>(STREAM_EXIT_EVENT, value) {
                    this.handle_exit(payload);
                }
            }),
        ));
    }

    /// Detach from the registry and discard all live buffers.
    pub fn unregister(&self, registry: &ListenerRegistry) {
        for handle in self.listeners.lock().drain(..) {
            registry.remove_listener(handle);
        }
        self.pending.lock().clear();
        self.publish_pending();
    }
}

fn parse_event<T: serde::de::DeserializeOwned>(event: &str, value: &Value) -> Option<T> {
    match serde_json::from_value::<Envelope<T>>(value.clone()) {
        Ok(envelope) => Some(envelope.data),
        Err(error) => {
            warn!(%event, %error, "Dropping malformed stream event payload");
            None
        }
    }
}
