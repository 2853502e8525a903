//! OpenAI-compatible `/chat/completions` streaming client.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::{json, Value};
use std::collections::{BTreeMap, VecDeque};

use super::model::{Message, ModelChunk, ModelClient, ModelRequest, ModelStream, Role, ToolCallRequest};
use crate::events::sse::SseDecoder;
use crate::secrets::{resolve_value, SecretResolver};
use crate::types::{Error, ModelConfig, Result};

#[derive(Debug, Clone)]
pub struct OpenAiModel {
    client: reqwest::Client,
    url: String,
    model: String,
}

impl OpenAiModel {
    pub fn new(client: reqwest::Client, base_url: &str, model: impl Into<String>) -> Self {
        Self {
            client,
            url: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            model: model.into(),
        }
    }

    /// Build from config, resolving the API key reference.
    pub async fn from_config(config: &ModelConfig, resolver: &dyn SecretResolver) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(reference) = &config.api_key_ref {
            let key = resolve_value(resolver, reference).await?;
            let mut value = HeaderValue::from_str(&format!("Bearer {}", key))
                .map_err(|_| Error::validation("api key is not a valid header value"))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        let client = reqwest::Client::builder().default_headers(headers).build()?;
        Ok(Self::new(client, &config.base_url, config.model.clone()))
    }

    fn body(&self, request: &ModelRequest) -> Value {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(prompt) = &request.system_prompt {
            messages.push(json!({"role": "system", "content": prompt}));
        }
        messages.extend(request.messages.iter().map(wire_message));

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
        });
        if !request.tools.is_empty() {
            body["tools"] = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
        }
        body
    }
}

fn wire_message(message: &Message) -> Value {
    match message.role {
        Role::Assistant if !message.tool_calls.is_empty() => json!({
            "role": "assistant",
            "content": if message.content.is_empty() { Value::Null } else { json!(message.content) },
            "tool_calls": message.tool_calls.iter().map(|c| json!({
                "id": c.id,
                "type": "function",
                "function": {"name": c.name, "arguments": c.arguments.to_string()},
            })).collect::<Vec<_>>(),
        }),
        Role::Tool => json!({
            "role": "tool",
            "tool_call_id": message.tool_call_id,
            "content": message.content,
        }),
        role => json!({"role": role, "content": message.content}),
    }
}

#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Turns streamed deltas into chunks. Tool calls arrive in fragments keyed
/// by index and are released once the stream finishes.
#[derive(Debug, Default)]
struct DeltaAccumulator {
    calls: BTreeMap<u64, PartialCall>,
}

impl DeltaAccumulator {
    fn apply(&mut self, data: &str, out: &mut VecDeque<ModelChunk>) -> Result<()> {
        let value: Value = serde_json::from_str(data)?;
        let Some(delta) = value.pointer("/choices/0/delta") else {
            return Ok(());
        };
        for key in ["reasoning_content", "reasoning"] {
            if let Some(text) = delta.get(key).and_then(Value::as_str) {
                if !text.is_empty() {
                    out.push_back(ModelChunk::Reasoning(text.to_string()));
                }
            }
        }
        if let Some(text) = delta.get("content").and_then(Value::as_str) {
            if !text.is_empty() {
                out.push_back(ModelChunk::Text(text.to_string()));
            }
        }
        for call in delta
            .get("tool_calls")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let index = call.get("index").and_then(Value::as_u64).unwrap_or(0);
            let partial = self.calls.entry(index).or_default();
            if let Some(id) = call.get("id").and_then(Value::as_str) {
                partial.id = id.to_string();
            }
            if let Some(function) = call.get("function") {
                if let Some(name) = function.get("name").and_then(Value::as_str) {
                    partial.name.push_str(name);
                }
                if let Some(args) = function.get("arguments").and_then(Value::as_str) {
                    partial.arguments.push_str(args);
                }
            }
        }
        Ok(())
    }

    fn finish(&mut self, out: &mut VecDeque<ModelChunk>) -> Result<()> {
        for (_, call) in std::mem::take(&mut self.calls) {
            let arguments = if call.arguments.trim().is_empty() {
                json!({})
            } else {
                serde_json::from_str(&call.arguments).map_err(|e| {
                    Error::remote(format!("model sent malformed arguments for {}: {}", call.name, e))
                })?
            };
            out.push_back(ModelChunk::ToolCall(ToolCallRequest {
                id: call.id,
                name: call.name,
                arguments,
            }));
        }
        Ok(())
    }
}

struct StreamState {
    body: futures::stream::BoxStream<'static, reqwest::Result<bytes::Bytes>>,
    decoder: SseDecoder,
    deltas: DeltaAccumulator,
    pending: VecDeque<ModelChunk>,
    finished: bool,
}

#[async_trait]
impl ModelClient for OpenAiModel {
    async fn stream(&self, request: ModelRequest) -> Result<ModelStream> {
        let response = self
            .client
            .post(&self.url)
            .json(&self.body(&request))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let detail: String = response.text().await.unwrap_or_default().chars().take(200).collect();
            return Err(match status.as_u16() {
                401 | 403 => Error::unauthenticated(format!("model backend: {}", status)),
                429 | 500..=599 => Error::unreachable(format!("model backend {}: {}", status, detail)),
                _ => Error::remote(format!("model backend {}: {}", status, detail)),
            });
        }

        let state = StreamState {
            body: response.bytes_stream().boxed(),
            decoder: SseDecoder::new(),
            deltas: DeltaAccumulator::default(),
            pending: VecDeque::new(),
            finished: false,
        };
        let chunks = stream::unfold(state, |mut state| async move {
            loop {
                if let Some(chunk) = state.pending.pop_front() {
                    return Some((Ok(chunk), state));
                }
                if state.finished {
                    return None;
                }
                let messages = match state.body.next().await {
                    Some(Ok(bytes)) => state.decoder.feed(&bytes),
                    Some(Err(e)) => {
                        state.finished = true;
                        return Some((Err(Error::from(e)), state));
                    }
                    None => {
                        state.finished = true;
                        state.decoder.finish().into_iter().collect()
                    }
                };
                for message in messages {
                    let outcome = if message.is_done() {
                        state.finished = true;
                        Ok(())
                    } else {
                        state.deltas.apply(&message.data, &mut state.pending)
                    };
                    if let Err(e) = outcome {
                        state.finished = true;
                        return Some((Err(e), state));
                    }
                }
                if state.finished {
                    if let Err(e) = state.deltas.finish(&mut state.pending) {
                        return Some((Err(e), state));
                    }
                }
            }
        });
        Ok(chunks.boxed())
    }
}
