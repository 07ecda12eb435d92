/// One complete frame from a `text/event-stream` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

/// Incremental server-sent-events parser. Feed it decoded text in arbitrary
/// chunk boundaries; it yields complete frames as blank lines arrive.
#[derive(Debug, Default)]
pub struct EventParser {
    buffer: String,
    event_type: Option<String>,
    data: String,
}

impl EventParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) -> Vec<SseFrame> {
        self.buffer.push_str(chunk);
        let mut frames = Vec::new();

        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            self.process_line(line, &mut frames);
        }
        frames
    }

    fn process_line(&mut self, line: &str, frames: &mut Vec<SseFrame>) {
        if line.is_empty() {
            // Blank line terminates the frame. Frames without data are
            // keep-alives and are not surfaced.
            if !self.data.is_empty() {
                // Multi-line data joins with a newline; only the single
                // trailing one from the last data line is not part of the
                // payload. Empty data lines before it are.
                let mut data = std::mem::take(&mut self.data);
                if data.ends_with('\n') {
                    data.pop();
                }
                frames.push(SseFrame {
                    event: self
                        .event_type
                        .take()
                        .unwrap_or_else(|| "message".to_string()),
                    data,
                });
            }
            self.event_type = None;
            return;
        }
        if line.starts_with(':') {
            return; // comment / heartbeat
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event_type = Some(value.to_string()),
            "data" => {
                self.data.push_str(value);
                self.data.push('\n');
            }
            // `id` and `retry` are not used by this client.
            _ => {}
        }
    }
}
