//! Executable handles: a resolved tool, closed over its execution path.

use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::catalog::{ToolDescriptor, ToolKind};
use super::local::LocalTool;
use crate::agent::AgentProfile;
use crate::connections::{ConnectionManager, RemoteTarget};
use crate::types::{Result, ToolCallId};

/// Result of [`ToolRegistry::resolve`](super::ToolRegistry::resolve).
#[derive(Debug, Clone)]
pub enum ExecutableHandle {
    Local(LocalHandle),
    Remote(RemoteHandle),
    SubAgent(SubAgentHandle),
}

impl ExecutableHandle {
    pub fn descriptor(&self) -> &ToolDescriptor {
        match self {
            ExecutableHandle::Local(h) => &h.descriptor,
            ExecutableHandle::Remote(h) => &h.descriptor,
            ExecutableHandle::SubAgent(h) => &h.descriptor,
        }
    }

    pub fn kind(&self) -> ToolKind {
        self.descriptor().kind
    }
}

#[derive(Debug, Clone)]
pub struct LocalHandle {
    pub(crate) descriptor: Arc<ToolDescriptor>,
    pub(crate) tool: Arc<dyn LocalTool>,
}

impl LocalHandle {
    pub async fn call(&self, arguments: Value) -> Result<Value> {
        self.tool.call(arguments).await
    }
}

/// Delegates to the shared connection pool.
#[derive(Debug, Clone)]
pub struct RemoteHandle {
    pub(crate) descriptor: Arc<ToolDescriptor>,
    pub(crate) target: RemoteTarget,
    pub(crate) pool: Arc<ConnectionManager>,
}

impl RemoteHandle {
    pub fn target(&self) -> &RemoteTarget {
        &self.target
    }

    /// Forward `arguments` as `{"name", "arguments"}`; the remote contract is
    /// otherwise opaque here.
    pub async fn call(
        &self,
        call_id: &ToolCallId,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let payload = json!({"name": self.descriptor.name, "arguments": arguments});
        self.pool.call(&self.target, call_id, payload, cancel).await
    }
}

/// Entry point for a nested agent run; executed by the agent loop.
#[derive(Debug, Clone)]
pub struct SubAgentHandle {
    pub(crate) descriptor: Arc<ToolDescriptor>,
    pub(crate) agent: String,
    pub(crate) profile: AgentProfile,
}

impl SubAgentHandle {
    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub fn profile(&self) -> &AgentProfile {
        &self.profile
    }
}
