//! Agent loop.
//!
//! A run streams one model turn at a time, relays reasoning, executes the
//! turn's tool calls concurrently and feeds their results back until the model
//! answers without calling tools. Every suspension point races the run's
//! cancellation token.

pub mod model;
pub mod openai;

pub use model::{
    Message, ModelChunk, ModelClient, ModelRequest, ModelStream, Role, ScriptedModel,
    ToolCallRequest,
};
pub use openai::OpenAiModel;

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use futures::{FutureExt, StreamExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::ToolStatus;
use crate::tools::{ExecutableHandle, SubAgentHandle, ToolKind, ToolOverlay, ToolRegistry};
use crate::types::{Error, PipelineConfig, Result, ToolCallId};

/// Named agent configuration, used for the top-level agent and for SubAgent
/// tools.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct AgentProfile {
    pub system_prompt: Option<String>,

    /// Tool ids this agent may call; all enabled tools when absent.
    pub tools: Option<Vec<String>>,

    /// Overrides `pipeline.max_iterations`.
    pub max_iterations: Option<u32>,
}

/// How a tool invocation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Completed(Value),
    Failed { code: String, message: String },
}

impl ToolOutcome {
    fn from_result(result: Result<Value>) -> Self {
        match result {
            Ok(value) => ToolOutcome::Completed(value),
            Err(e) => ToolOutcome::Failed {
                code: e.code().to_string(),
                message: e.public_message(),
            },
        }
    }

    /// Content handed back to the model.
    fn to_message_content(&self) -> String {
        match self {
            ToolOutcome::Completed(Value::String(s)) => s.clone(),
            ToolOutcome::Completed(value) => value.to_string(),
            ToolOutcome::Failed { code, message } => {
                json!({"error": {"code": code, "message": message}}).to_string()
            }
        }
    }
}

/// Internal activity of a run, before framing.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Reasoning {
        text: String,
    },
    ToolUse {
        invocation_id: ToolCallId,
        tool_id: String,
        kind: Option<ToolKind>,
        arguments: Value,
    },
    ToolProgress {
        invocation_id: ToolCallId,
        tool_id: String,
        status: ToolStatus,
    },
    ToolResult {
        invocation_id: ToolCallId,
        tool_id: String,
        outcome: ToolOutcome,
    },
    Response {
        text: String,
    },
}

/// Receives agent events in production order.
///
/// `emit` fails with `Cancelled` once the consumer is gone; the run stops at
/// that point.
#[async_trait]
pub trait EventObserver: Send + Sync {
    async fn emit(&self, event: AgentEvent) -> Result<()>;
}

/// Discards events. Nested sub-agent runs report only their final answer.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullObserver;

#[async_trait]
impl EventObserver for NullObserver {
    async fn emit(&self, _event: AgentEvent) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub iterations: u32,
    pub response: String,
}

#[derive(Debug, Clone)]
pub struct Agent {
    model: Arc<dyn ModelClient>,
    tools: Arc<ToolRegistry>,
    profile: AgentProfile,
    max_iterations: u32,
    max_depth: u32,
    depth: u32,
}

impl Agent {
    pub fn new(
        model: Arc<dyn ModelClient>,
        tools: Arc<ToolRegistry>,
        profile: AgentProfile,
        limits: &PipelineConfig,
    ) -> Self {
        Self {
            model,
            tools,
            profile,
            max_iterations: limits.max_iterations,
            max_depth: limits.max_subagent_depth,
            depth: 0,
        }
    }

    pub fn profile(&self) -> &AgentProfile {
        &self.profile
    }

    /// Run one user message to completion.
    ///
    /// `history` is only updated when the run succeeds, so an aborted run
    /// never leaves unanswered tool calls behind.
    pub async fn run(
        &self,
        history: &mut Vec<Message>,
        overlay: &ToolOverlay,
        input: &str,
        observer: &dyn EventObserver,
        cancel: &CancellationToken,
    ) -> Result<RunSummary> {
        let mut transcript = history.clone();
        transcript.push(Message::user(input));
        let max_iterations = self.profile.max_iterations.unwrap_or(self.max_iterations);

        for iteration in 1..=max_iterations {
            if cancel.is_cancelled() {
                return Err(Error::cancelled("run aborted"));
            }
            let request = ModelRequest {
                system_prompt: self.profile.system_prompt.clone(),
                messages: transcript.clone(),
                tools: self.tools.specs(overlay, self.profile.tools.as_deref()),
            };
            let mut stream = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::cancelled("run aborted")),
                stream = self.model.stream(request) => stream?,
            };

            let mut text = String::new();
            let mut calls = Vec::new();
            loop {
                let chunk = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Error::cancelled("run aborted")),
                    chunk = stream.next() => chunk,
                };
                match chunk {
                    None => break,
                    Some(Err(e)) => return Err(e),
                    Some(Ok(ModelChunk::Reasoning(thought))) => {
                        observer.emit(AgentEvent::Reasoning { text: thought }).await?
                    }
                    Some(Ok(ModelChunk::Text(delta))) => text.push_str(&delta),
                    Some(Ok(ModelChunk::ToolCall(call))) => calls.push(call),
                }
            }

            if calls.is_empty() {
                transcript.push(Message::assistant(text.clone(), Vec::new()));
                observer
                    .emit(AgentEvent::Response { text: text.clone() })
                    .await?;
                *history = transcript;
                debug!(iteration, depth = self.depth, "agent answered");
                return Ok(RunSummary {
                    iterations: iteration,
                    response: text,
                });
            }

            // Text that accompanies tool calls is the model thinking aloud.
            if !text.is_empty() {
                observer
                    .emit(AgentEvent::Reasoning { text: text.clone() })
                    .await?;
            }
            transcript.push(Message::assistant(text, calls.clone()));

            let outcomes = join_all(
                calls
                    .iter()
                    .map(|call| self.invoke(call, overlay, observer, cancel)),
            )
            .await;
            if cancel.is_cancelled() {
                return Err(Error::cancelled("run aborted"));
            }
            for (call, outcome) in calls.iter().zip(outcomes) {
                transcript.push(Message::tool(call.id.clone(), outcome?.to_message_content()));
            }
        }

        warn!(max_iterations, depth = self.depth, "agent ran out of iterations");
        Err(Error::iteration_limit(format!(
            "no final answer after {} model turns",
            max_iterations
        )))
    }

    /// One tool invocation. Tool failures become a failed outcome; only an
    /// observer failure (consumer gone) is returned as an error.
    async fn invoke(
        &self,
        call: &ToolCallRequest,
        overlay: &ToolOverlay,
        observer: &dyn EventObserver,
        cancel: &CancellationToken,
    ) -> Result<ToolOutcome> {
        let invocation_id = ToolCallId::new();
        let tool_id = call.name.clone();
        let resolved = self.tools.resolve(&tool_id, overlay).await;
        let kind = match &resolved {
            Ok(handle) => Some(handle.kind()),
            Err(_) => self.tools.descriptor(&tool_id).ok().map(|d| d.kind),
        };

        observer
            .emit(AgentEvent::ToolUse {
                invocation_id: invocation_id.clone(),
                tool_id: tool_id.clone(),
                kind,
                arguments: call.arguments.clone(),
            })
            .await?;
        observer
            .emit(AgentEvent::ToolProgress {
                invocation_id: invocation_id.clone(),
                tool_id: tool_id.clone(),
                status: ToolStatus::Pending,
            })
            .await?;

        let result = match resolved {
            Err(e) => Err(e),
            Ok(handle) => match self.tools.validate_arguments(&tool_id, &call.arguments) {
                Err(e) => Err(e),
                Ok(()) => {
                    observer
                        .emit(AgentEvent::ToolProgress {
                            invocation_id: invocation_id.clone(),
                            tool_id: tool_id.clone(),
                            status: ToolStatus::InProgress,
                        })
                        .await?;
                    let token = cancel.child_token();
                    self.execute(&handle, &invocation_id, call.arguments.clone(), overlay, &token)
                        .await
                }
            },
        };

        if cancel.is_cancelled() {
            return Err(Error::cancelled("run aborted"));
        }
        if let Err(e) = &result {
            debug!(tool_id = %tool_id, code = e.code(), error = %e, "tool invocation failed");
        }
        let outcome = ToolOutcome::from_result(result);
        observer
            .emit(AgentEvent::ToolResult {
                invocation_id,
                tool_id,
                outcome: outcome.clone(),
            })
            .await?;
        Ok(outcome)
    }

    async fn execute(
        &self,
        handle: &ExecutableHandle,
        invocation_id: &ToolCallId,
        arguments: Value,
        overlay: &ToolOverlay,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        match handle {
            ExecutableHandle::Local(local) => tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Error::cancelled("tool call aborted")),
                result = local.call(arguments) => result,
            },
            ExecutableHandle::Remote(remote) => remote.call(invocation_id, arguments, cancel).await,
            ExecutableHandle::SubAgent(sub) => self.run_nested(sub, arguments, overlay, cancel).await,
        }
    }

    /// Boxed to break the `run -> invoke -> run` recursion.
    fn run_nested<'a>(
        &'a self,
        handle: &'a SubAgentHandle,
        arguments: Value,
        overlay: &'a ToolOverlay,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Value>> {
        async move {
            if self.depth >= self.max_depth {
                return Err(Error::validation(format!(
                    "sub-agent {} exceeds nesting depth {}",
                    handle.agent(),
                    self.max_depth
                )));
            }
            let input = match arguments.get("input").and_then(Value::as_str) {
                Some(text) => text.to_string(),
                None => arguments.to_string(),
            };
            let child = Agent {
                model: Arc::clone(&self.model),
                tools: Arc::clone(&self.tools),
                profile: handle.profile().clone(),
                max_iterations: self.max_iterations,
                max_depth: self.max_depth,
                depth: self.depth + 1,
            };
            info!(agent = handle.agent(), depth = child.depth, "starting sub-agent run");
            let mut history = Vec::new();
            let summary = child
                .run(&mut history, overlay, &input, &NullObserver, cancel)
                .await?;
            Ok(json!({"agent": handle.agent(), "response": summary.response}))
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::{ConnectionManager, EndpointClassifier, HttpConnector, HttpSender};
    use crate::secrets::StaticSecretResolver;
    use crate::signing::{NoCredentials, RequestSigner};
    use crate::tools::{LocalToolTable, ToolCatalog, ToolDescriptor};
    use crate::types::{PoolConfig, SigningConfig};
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<AgentEvent>>,
    }

    impl Recorder {
        fn labels(&self) -> Vec<String> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .map(|e| match e {
                    AgentEvent::Reasoning { .. } => "reasoning".to_string(),
                    AgentEvent::ToolUse { tool_id, .. } => format!("tool_use:{}", tool_id),
                    AgentEvent::ToolProgress { status, .. } => format!("progress:{:?}", status),
                    AgentEvent::ToolResult { outcome, .. } => match outcome {
                        ToolOutcome::Completed(_) => "result:ok".to_string(),
                        ToolOutcome::Failed { code, .. } => format!("result:{}", code),
                    },
                    AgentEvent::Response { .. } => "response".to_string(),
                })
                .collect()
        }
    }

    #[async_trait]
    impl EventObserver for Recorder {
        async fn emit(&self, event: AgentEvent) -> Result<()> {
            self.events.lock().unwrap().push(event);
            Ok(())
        }
    }

    fn registry() -> Arc<ToolRegistry> {
        let signer = Arc::new(RequestSigner::new(Arc::new(NoCredentials), Duration::from_secs(300)));
        let sender = Arc::new(HttpSender::new(reqwest::Client::new(), signer));
        let pool = Arc::new(ConnectionManager::new(
            PoolConfig::default(),
            EndpointClassifier::new(&SigningConfig::default()).unwrap(),
            Arc::new(StaticSecretResolver::new()),
            Arc::new(HttpConnector::new(sender)),
        ));
        let descriptors: Vec<ToolDescriptor> = serde_json::from_value(json!([
            {"id": "echo", "name": "echo", "kind": "built_in",
             "input_schema": {"type": "object", "required": ["text"]},
             "binding": {"type": "local", "module": "builtin::text", "symbol": "echo"}},
            {"id": "research", "name": "research", "kind": "sub_agent",
             "binding": {"type": "sub_agent", "agent": "researcher"}}
        ]))
        .unwrap();
        let mut agents = HashMap::new();
        agents.insert(
            "researcher".to_string(),
            AgentProfile {
                system_prompt: Some("dig".into()),
                tools: Some(vec!["research".into()]),
                max_iterations: Some(2),
            },
        );
        Arc::new(
            ToolRegistry::new(
                ToolCatalog::from_descriptors(descriptors).unwrap(),
                LocalToolTable::with_builtins(),
                pool,
                agents,
            )
            .unwrap(),
        )
    }

    fn agent(model: Arc<ScriptedModel>) -> Agent {
        Agent::new(model, registry(), AgentProfile::default(), &PipelineConfig::default())
    }

    fn call(id: &str, name: &str, arguments: Value) -> ModelChunk {
        ModelChunk::ToolCall(ToolCallRequest {
            id: id.into(),
            name: name.into(),
            arguments,
        })
    }

    #[tokio::test]
    async fn tool_turn_then_answer() {
        let model = Arc::new(ScriptedModel::new([
            vec![
                ModelChunk::Reasoning("need echo".into()),
                call("c1", "echo", json!({"text": "hi"})),
            ],
            vec![ModelChunk::Text("done".into())],
        ]));
        let agent = agent(Arc::clone(&model));
        let recorder = Recorder::default();
        let mut history = Vec::new();
        let summary = agent
            .run(&mut history, &ToolOverlay::new(), "say hi", &recorder, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary, RunSummary { iterations: 2, response: "done".into() });
        assert_eq!(
            recorder.labels(),
            vec![
                "reasoning",
                "tool_use:echo",
                "progress:Pending",
                "progress:InProgress",
                "result:ok",
                "response"
            ]
        );
        // user, assistant(call), tool, assistant(answer)
        assert_eq!(history.len(), 4);
        assert_eq!(history[2].tool_call_id.as_deref(), Some("c1"));
        let second_request = &model.requests()[1];
        assert_eq!(second_request.messages.len(), 3);
    }

    #[tokio::test]
    async fn failing_tools_do_not_fail_the_run() {
        let model = Arc::new(ScriptedModel::new([
            vec![
                call("c1", "missing", json!({})),
                call("c2", "echo", json!({"wrong": 1})),
            ],
            vec![ModelChunk::Text("sorry".into())],
        ]));
        let recorder = Recorder::default();
        let mut history = Vec::new();
        agent(model)
            .run(&mut history, &ToolOverlay::new(), "go", &recorder, &CancellationToken::new())
            .await
            .unwrap();

        let labels = recorder.labels();
        assert!(labels.contains(&"result:not_found".to_string()));
        assert!(labels.contains(&"result:validation".to_string()));
        // neither invocation got past pending
        assert!(!labels.contains(&"progress:InProgress".to_string()));
        assert!(history[2].content.contains("not_found"));
        assert_eq!(labels.last().map(String::as_str), Some("response"));
    }

    #[tokio::test]
    async fn disabled_tool_reports_disabled() {
        let model = Arc::new(ScriptedModel::new([
            vec![call("c1", "echo", json!({"text": "x"}))],
            vec![ModelChunk::Text("ok".into())],
        ]));
        let mut overlay = ToolOverlay::new();
        overlay.set("echo", false);
        let recorder = Recorder::default();
        agent(model)
            .run(&mut Vec::new(), &overlay, "go", &recorder, &CancellationToken::new())
            .await
            .unwrap();
        assert!(recorder.labels().contains(&"result:disabled".to_string()));
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn iteration_limit_is_an_error_and_history_is_untouched() {
        let turns = (0..8).map(|i| vec![call(&format!("c{}", i), "echo", json!({"text": "again"}))]);
        let model = Arc::new(ScriptedModel::new(turns));
        let mut history = vec![Message::user("earlier"), Message::assistant("reply", Vec::new())];
        let err = agent(model)
            .run(&mut history, &ToolOverlay::new(), "loop", &NullObserver, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "max_iterations");
        assert_eq!(history.len(), 2);
        assert!(logs_contain("agent ran out of iterations"));
    }

    #[tokio::test]
    async fn cancelled_run_emits_nothing() {
        let model = Arc::new(ScriptedModel::new([vec![ModelChunk::Text("never".into())]]));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let recorder = Recorder::default();
        let err = agent(model)
            .run(&mut Vec::new(), &ToolOverlay::new(), "hi", &recorder, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "cancelled");
        assert!(recorder.labels().is_empty());
    }

    #[tokio::test]
    async fn model_errors_end_the_run() {
        let mut mock = model::MockModelClient::new();
        mock.expect_stream()
            .returning(|_| Err(Error::unreachable("model backend down")));
        let agent = Agent::new(
            Arc::new(mock),
            registry(),
            AgentProfile::default(),
            &PipelineConfig::default(),
        );
        let err = agent
            .run(&mut Vec::new(), &ToolOverlay::new(), "hi", &NullObserver, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "unreachable");
    }

    #[tokio::test]
    async fn sub_agent_answers_as_tool_result() {
        let model = Arc::new(ScriptedModel::new([
            vec![call("c1", "research", json!({"input": "find it"}))],
            // nested run
            vec![ModelChunk::Text("found it".into())],
            vec![ModelChunk::Text("here you go".into())],
        ]));
        let recorder = Recorder::default();
        let summary = agent(Arc::clone(&model))
            .run(&mut Vec::new(), &ToolOverlay::new(), "research", &recorder, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.response, "here you go");

        let requests = model.requests();
        assert_eq!(requests[1].system_prompt.as_deref(), Some("dig"));
        assert_eq!(requests[1].messages, vec![Message::user("find it")]);
        let events = recorder.events.lock().unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            AgentEvent::ToolResult { outcome: ToolOutcome::Completed(v), .. }
                if v["response"] == "found it"
        )));
    }

    #[tokio::test]
    async fn sub_agent_depth_is_bounded() {
        // the researcher profile may call itself; depth 2 is the limit
        let model = Arc::new(ScriptedModel::new([
            vec![call("c1", "research", json!({"input": "a"}))],
            vec![call("c2", "research", json!({"input": "b"}))],
            vec![call("c3", "research", json!({"input": "c"}))],
            vec![ModelChunk::Text("depth 2 gave up".into())],
            vec![ModelChunk::Text("depth 1 done".into())],
            vec![ModelChunk::Text("top done".into())],
        ]));
        let summary = agent(Arc::clone(&model))
            .run(&mut Vec::new(), &ToolOverlay::new(), "go", &NullObserver, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.response, "top done");
        // the third nested call was refused without a model turn
        let refused = &model.requests()[3];
        assert!(refused.messages.last().unwrap().content.contains("validation"));
    }
}
