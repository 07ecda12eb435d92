use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::parser::{EventParser, SseFrame};
use super::registry::ListenerRegistry;

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

/// Long-lived server-to-client event channel over SSE.
///
/// Owns a background task that keeps one connection per session alive,
/// reconnecting with bounded backoff. Events are parsed and fanned out
/// through the shared [`ListenerRegistry`]; wake-ups missed while
/// disconnected are recovered by the next pull, so reconnection is a latency
/// concern, not a correctness one.
pub struct SseClient {
    state_rx: watch::Receiver<ConnectionState>,
    task: JoinHandle<()>,
}

impl SseClient {
    pub fn connect(url: String, registry: Arc<ListenerRegistry>) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let task = tokio::spawn(run_connection(url, registry, state_tx));
        Self { state_rx, task }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn shutdown(self) {
        self.task.abort();
    }
}

async fn run_connection(
    url: String,
    registry: Arc<ListenerRegistry>,
    state_tx: watch::Sender<ConnectionState>,
) {
    let client = reqwest::Client::new();
    let mut backoff = INITIAL_BACKOFF;

    loop {
        let _ = state_tx.send(ConnectionState::Connecting);
        debug!(%url, "Connecting to SSE");

        let response = client
            .get(&url)
            .header("Accept", "text/event-stream")
            .send()
            .await
            .and_then(|response| response.error_for_status());

        match response {
            Ok(response) => {
                info!("SSE connection opened");
                let _ = state_tx.send(ConnectionState::Connected);
                backoff = INITIAL_BACKOFF;

                let mut parser = EventParser::new();
                let mut carry = Vec::new();
                let mut stream = response.bytes_stream();
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(bytes) => {
                            carry.extend_from_slice(&bytes);
                            let text = take_complete_utf8(&mut carry);
                            for frame in parser.push(&text) {
                                dispatch_frame(&registry, frame);
                            }
                        }
                        Err(error) => {
                            warn!(%error, "SSE stream failed");
                            break;
                        }
                    }
                }
                info!("SSE connection closed");
                let _ = state_tx.send(ConnectionState::Disconnected);
            }
            Err(error) => {
                warn!(%error, "SSE connection error");
                let _ = state_tx.send(ConnectionState::Error);
            }
        }

        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

/// Drain the decodable prefix of `buffer` as text. Network chunk boundaries
/// can split a multi-byte UTF-8 sequence; the incomplete tail stays in the
/// buffer until the next chunk completes it, so streamed non-ASCII text is
/// never mangled into replacement characters.
fn take_complete_utf8(buffer: &mut Vec<u8>) -> String {
    match std::str::from_utf8(buffer) {
        Ok(text) => {
            let text = text.to_string();
            buffer.clear();
            text
        }
        Err(error) if error.error_len().is_none() => {
            let split = error.valid_up_to();
            let text = String::from_utf8_lossy(&buffer[..split]).into_owned();
            buffer.drain(..split);
            text
        }
        Err(_) => {
            // Genuinely invalid bytes mid-stream: decode lossily and move on.
            let text = String::from_utf8_lossy(buffer).into_owned();
            buffer.clear();
            text
        }
    }
}

/// Parse a frame's payload and fan it out. A malformed payload is logged and
/// dropped; it never tears down the connection.
fn dispatch_frame(registry: &ListenerRegistry, frame: SseFrame) {
    match serde_json::from_str(&frame.data) {
        Ok(payload) => registry.dispatch(&frame.event, &payload),
        Err(error) => {
            warn!(event = %frame.event, %error, "Dropping malformed SSE payload");
        }
    }
}
