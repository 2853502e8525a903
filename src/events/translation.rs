//! Agent events → canonical event type and payload.
//!
//! Pure mapping. Payload keys are camelCase to match the frame envelope:
//!   Reasoning    → reasoning     {text}
//!   ToolUse      → tool_use      {invocationId, toolId, kind?, arguments}
//!   ToolProgress → tool_progress {invocationId, toolId, status}
//!   ToolResult   → tool_result   {invocationId, toolId, status, result | error}
//!   Response     → response      {text}

use serde_json::{json, Value};

use super::types::{EventType, ToolStatus};
use crate::agent::{AgentEvent, ToolOutcome};
use crate::types::{Error, RunId};

pub fn translate_agent_event(event: AgentEvent) -> (EventType, Value) {
    match event {
        AgentEvent::Reasoning { text } => (EventType::Reasoning, json!({ "text": text })),

        AgentEvent::ToolUse {
            invocation_id,
            tool_id,
            kind,
            arguments,
        } => {
            let mut payload = json!({
                "invocationId": invocation_id,
                "toolId": tool_id,
                "arguments": arguments,
            });
            if let Some(kind) = kind {
                payload["kind"] = json!(kind);
            }
            (EventType::ToolUse, payload)
        }

        AgentEvent::ToolProgress {
            invocation_id,
            tool_id,
            status,
        } => (
            EventType::ToolProgress,
            json!({
                "invocationId": invocation_id,
                "toolId": tool_id,
                "status": status,
            }),
        ),

        AgentEvent::ToolResult {
            invocation_id,
            tool_id,
            outcome,
        } => {
            let payload = match outcome {
                ToolOutcome::Completed(result) => json!({
                    "invocationId": invocation_id,
                    "toolId": tool_id,
                    "status": ToolStatus::Completed,
                    "result": result,
                }),
                ToolOutcome::Failed { code, message } => json!({
                    "invocationId": invocation_id,
                    "toolId": tool_id,
                    "status": ToolStatus::Failed,
                    "error": {"code": code, "message": message},
                }),
            };
            (EventType::ToolResult, payload)
        }

        AgentEvent::Response { text } => (EventType::Response, json!({ "text": text })),
    }
}

pub fn init_payload(run_id: &RunId, input: &str) -> Value {
    json!({ "runId": run_id, "input": input })
}

pub fn complete_payload(run_id: &RunId, iterations: u32) -> Value {
    json!({ "runId": run_id, "iterations": iterations })
}

/// Terminal error payload; only the public message leaves the process.
pub fn error_payload(run_id: &RunId, error: &Error) -> Value {
    json!({
        "runId": run_id,
        "code": error.code(),
        "message": error.public_message(),
    })
}
