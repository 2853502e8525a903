//! Canonical client-facing event schema.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::types::SessionId;

/// Event kinds emitted on the client stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Init,
    Reasoning,
    ToolUse,
    ToolProgress,
    ToolResult,
    Response,
    Complete,
    Error,
}

impl EventType {
    /// `complete` and `error` end a run; nothing follows them.
    pub fn is_terminal(self) -> bool {
        matches!(self, EventType::Complete | EventType::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Init => "init",
            EventType::Reasoning => "reasoning",
            EventType::ToolUse => "tool_use",
            EventType::ToolProgress => "tool_progress",
            EventType::ToolResult => "tool_result",
            EventType::Response => "response",
            EventType::Complete => "complete",
            EventType::Error => "error",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution state of a single tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// One frame of the event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(rename = "sessionId")]
    pub session_id: SessionId,
    /// Per-session, strictly increasing, never reused.
    pub sequence: u64,
    pub payload: Value,
}

impl ToolEvent {
    pub fn is_terminal(&self) -> bool {
        self.event_type.is_terminal()
    }

    /// Tool invocation id carried by tool-scoped events.
    pub fn invocation_id(&self) -> Option<&str> {
        self.payload.get("invocationId").and_then(Value::as_str)
    }
}
