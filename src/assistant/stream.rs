use serde_json::Value;

/// Splits a byte stream into lines. Bytes are held until a full line is
/// available so multi-byte characters split across chunks survive.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buffer: Vec<u8>,
    max_buffer_bytes: Option<usize>,
    overflowed_bytes: usize,
}

impl LineBuffer {
    pub fn new(max_buffer_bytes: Option<usize>) -> Self {
        Self {
            buffer: Vec::new(),
            max_buffer_bytes,
            overflowed_bytes: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(idx) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let mut line = self.buffer.drain(..=idx).collect::<Vec<u8>>();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }

        if let Some(max) = self.max_buffer_bytes {
            if self.buffer.len() > max {
                let excess = self.buffer.len() - max;
                self.buffer.drain(..excess);
                self.overflowed_bytes = self.overflowed_bytes.saturating_add(excess);
            }
        }
        lines
    }

    pub fn consume_overflowed_bytes(&mut self) -> usize {
        std::mem::take(&mut self.overflowed_bytes)
    }

    pub fn flush(&mut self) -> String {
        let rest = std::mem::take(&mut self.buffer);
        String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    Delta(String),
    Done,
}

/// Interprets one server-sent-events line. Comments, other fields, blank
/// lines and frames without text yield `None`.
pub fn parse_sse_line(line: &str) -> Option<SseEvent> {
    let data = line.strip_prefix("data:")?.trim();
    if data == "[DONE]" {
        return Some(SseEvent::Done);
    }
    let payload: Value = match serde_json::from_str(data) {
        Ok(payload) => payload,
        Err(error) => {
            tracing::debug!(error = %error, "skipping undecodable stream frame");
            return None;
        }
    };
    let delta = payload
        .pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
        .or_else(|| payload.get("content").and_then(Value::as_str))?;
    if delta.is_empty() {
        return None;
    }
    Some(SseEvent::Delta(delta.to_string()))
}

/// Accumulates streamed text deltas.
#[derive(Debug, Default, Clone)]
pub struct DeltaCollector {
    text: String,
    deltas: usize,
}

impl DeltaCollector {
    pub fn push(&mut self, delta: &str) {
        self.text.push_str(delta);
        self.deltas += 1;
    }

    pub fn text(&self) -> String {
        self.text.trim().to_string()
    }

    pub fn delta_count(&self) -> usize {
        self.deltas
    }
}
