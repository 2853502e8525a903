//! Tool Registry: catalog + local table + pool, resolved per session overlay.

use jsonschema::Validator;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use super::catalog::{ToolBinding, ToolCatalog, ToolDescriptor, ToolOverlay, ToolSpec};
use super::handle::{ExecutableHandle, LocalHandle, RemoteHandle, SubAgentHandle};
use super::local::LocalToolTable;
use crate::agent::AgentProfile;
use crate::connections::ConnectionManager;
use crate::types::{Error, Result};

pub struct ToolRegistry {
    catalog: ToolCatalog,
    local: LocalToolTable,
    pool: Arc<ConnectionManager>,
    agents: HashMap<String, AgentProfile>,
    validators: HashMap<String, Validator>,
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.catalog.len())
            .field("local", &self.local.len())
            .field("agents", &self.agents.keys().collect::<Vec<_>>())
            .field("schemas", &self.validators.len())
            .finish()
    }
}

impl ToolRegistry {
    /// Fails with `Validation` when a descriptor carries an invalid schema.
    pub fn new(
        catalog: ToolCatalog,
        local: LocalToolTable,
        pool: Arc<ConnectionManager>,
        agents: HashMap<String, AgentProfile>,
    ) -> Result<Self> {
        let mut validators = HashMap::new();
        for entry in catalog.entries() {
            if let Some(schema) = &entry.input_schema {
                let validator = jsonschema::validator_for(schema).map_err(|e| {
                    Error::validation(format!("tool {}: invalid input schema: {}", entry.id, e))
                })?;
                validators.insert(entry.id.clone(), validator);
            }
        }
        Ok(Self {
            catalog,
            local,
            pool,
            agents,
            validators,
        })
    }

    pub fn pool(&self) -> &Arc<ConnectionManager> {
        &self.pool
    }

    /// Catalog with `enabled` resolved for the given overlay.
    pub fn catalog(&self, overlay: &ToolOverlay) -> Vec<ToolDescriptor> {
        self.catalog.view(overlay)
    }

    pub fn descriptor(&self, tool_id: &str) -> Result<&Arc<ToolDescriptor>> {
        self.catalog
            .get(tool_id)
            .ok_or_else(|| Error::not_found(format!("unknown tool: {}", tool_id)))
    }

    pub fn set_enabled(&self, overlay: &mut ToolOverlay, tool_id: &str, enabled: bool) -> Result<()> {
        self.descriptor(tool_id)?;
        overlay.set(tool_id, enabled);
        debug!(tool_id, enabled, "tool toggled");
        Ok(())
    }

    pub fn is_enabled(&self, overlay: &ToolOverlay, tool_id: &str) -> bool {
        self.catalog.is_enabled(tool_id, overlay).unwrap_or(false)
    }

    /// Specs of enabled tools, optionally restricted to `allowed` ids.
    pub fn specs(&self, overlay: &ToolOverlay, allowed: Option<&[String]>) -> Vec<ToolSpec> {
        self.catalog
            .entries()
            .into_iter()
            .filter(|entry| allowed.map_or(true, |ids| ids.contains(&entry.id)))
            .filter(|entry| self.is_enabled(overlay, &entry.id))
            .map(|entry| entry.spec())
            .collect()
    }

    /// Resolve a tool into its execution path.
    ///
    /// Remote endpoints are resolved through the secret resolver here, so a
    /// dangling reference surfaces as `UnresolvableBinding` before any call.
    pub async fn resolve(&self, tool_id: &str, overlay: &ToolOverlay) -> Result<ExecutableHandle> {
        let descriptor = Arc::clone(self.descriptor(tool_id)?);
        if !self.is_enabled(overlay, tool_id) {
            return Err(Error::disabled(tool_id.to_string()));
        }
        match &descriptor.binding {
            ToolBinding::Local { module, symbol } => {
                let tool = self.local.get(module, symbol)?;
                Ok(ExecutableHandle::Local(LocalHandle { descriptor, tool }))
            }
            ToolBinding::Remote { .. } => {
                let target = descriptor
                    .remote_target()
                    .ok_or_else(|| Error::internal("remote binding without target"))?;
                self.pool.resolve(&target).await?;
                Ok(ExecutableHandle::Remote(RemoteHandle {
                    descriptor,
                    target,
                    pool: Arc::clone(&self.pool),
                }))
            }
            ToolBinding::SubAgent { agent } => {
                let profile = self.agents.get(agent).cloned().ok_or_else(|| {
                    Error::unresolvable(format!("unknown agent profile: {}", agent))
                })?;
                let agent = agent.clone();
                Ok(ExecutableHandle::SubAgent(SubAgentHandle {
                    descriptor,
                    agent,
                    profile,
                }))
            }
        }
    }

    /// Check call arguments against the descriptor's input schema.
    pub fn validate_arguments(&self, tool_id: &str, arguments: &Value) -> Result<()> {
        let Some(validator) = self.validators.get(tool_id) else {
            return Ok(());
        };
        if validator.is_valid(arguments) {
            return Ok(());
        }
        let problems: Vec<String> = validator
            .iter_errors(arguments)
            .map(|e| e.to_string())
            .collect();
        Err(Error::validation(format!(
            "invalid arguments for {}: {}",
            tool_id,
            problems.join("; ")
        )))
    }
}
