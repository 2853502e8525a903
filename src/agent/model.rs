//! Model seam: an opaque, streaming producer of reasoning, text and tool calls.

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt::Debug;
use std::sync::Mutex;

use crate::tools::ToolSpec;
use crate::types::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    /// Tool id in the catalog.
    pub name: String,
    pub arguments: Value,
}

/// One entry of the conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            tool_calls,
            ..Self::plain(Role::Assistant, content)
        }
    }

    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            ..Self::plain(Role::Tool, content)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    pub system_prompt: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModelChunk {
    Reasoning(String),
    Text(String),
    ToolCall(ToolCallRequest),
}

pub type ModelStream = BoxStream<'static, Result<ModelChunk>>;

/// Inference backend.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ModelClient: Send + Sync + Debug {
    /// Start one model turn.
    async fn stream(&self, request: ModelRequest) -> Result<ModelStream>;
}

/// Replays canned turns in order. Each `stream` call consumes one turn and
/// records the request it was given.
#[derive(Debug, Default)]
pub struct ScriptedModel {
    turns: Mutex<VecDeque<Vec<ModelChunk>>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new(turns: impl IntoIterator<Item = Vec<ModelChunk>>) -> Self {
        Self {
            turns: Mutex::new(turns.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Append more turns, e.g. for a follow-up message in the same session.
    pub fn push_turn(&self, turn: Vec<ModelChunk>) {
        if let Ok(mut turns) = self.turns.lock() {
            turns.push_back(turn);
        }
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn stream(&self, request: ModelRequest) -> Result<ModelStream> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        let turn = self
            .turns
            .lock()
            .map_err(|_| Error::internal("scripted model poisoned"))?
            .pop_front()
            .ok_or_else(|| Error::internal("scripted model has no turns left"))?;
        Ok(Box::pin(stream::iter(turn.into_iter().map(Ok))))
    }
}
