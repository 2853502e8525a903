//! Server-sent-events framing.
//!
//! Frames are `data: <json>\n\n`; a stream ends with `data: [DONE]\n\n`.
//! [`SseDecoder`] is the incremental, line-buffered parser used both by
//! clients of the event stream and by the persistent transport when a tool
//! server answers with `text/event-stream`. Partial frames are buffered
//! across reads until their terminating blank line arrives.

use bytes::Bytes;

use super::types::ToolEvent;
use crate::types::Result;

pub const DONE_SENTINEL: &str = "[DONE]";
pub const CONTENT_TYPE: &str = "text/event-stream";

/// Encode a payload as one frame. Multi-line data gets one `data:` per line.
pub fn encode_data(data: &str) -> Bytes {
    let mut out = String::with_capacity(data.len() + 8);
    for line in data.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    Bytes::from(out)
}

pub fn encode_event(event: &ToolEvent) -> Result<Bytes> {
    Ok(encode_data(&serde_json::to_string(event)?))
}

pub fn done_frame() -> Bytes {
    Bytes::from_static(b"data: [DONE]\n\n")
}

/// One dispatched SSE message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseMessage {
    pub event: Option<String>,
    pub data: String,
}

impl SseMessage {
    pub fn is_done(&self) -> bool {
        self.data == DONE_SENTINEL
    }

    /// Parse as a [`ToolEvent`]; `None` for the sentinel.
    pub fn tool_event(&self) -> Result<Option<ToolEvent>> {
        if self.is_done() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&self.data)?))
    }
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
    event: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk as read off the wire; returns every completed message.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseMessage> {
        self.buffer.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            // a complete line never splits a UTF-8 sequence
            let line = String::from_utf8_lossy(&line);
            if let Some(message) = self.process_line(&line) {
                out.push(message);
            }
        }
        out
    }

    /// Flush a trailing message that lacked its blank line.
    pub fn finish(&mut self) -> Option<SseMessage> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string();
            self.process_line(&line);
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<SseMessage> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => self.data.push(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseMessage> {
        if self.data.is_empty() {
            self.event = None;
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseMessage {
            event: self.event.take(),
            data,
        })
    }
}
