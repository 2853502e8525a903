//! Tool catalog: descriptors for the four tool kinds and per-session overlays.
//!
//! Descriptors are immutable once registered; only the enabled flag varies,
//! and it varies per session through a [`ToolOverlay`].

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::connections::{RemoteTarget, TransportKind};
use crate::types::{Error, Result};

// =============================================================================
// Descriptor
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    BuiltIn,
    Custom,
    Remote,
    SubAgent,
}

/// How a tool is reached. Tagged by `type` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolBinding {
    /// In-process callable, looked up as `module::symbol`.
    Local { module: String, symbol: String },
    Remote {
        /// Literal URL or `ref://name`.
        endpoint: String,
        #[serde(default = "default_transport")]
        transport: TransportKind,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        sign: bool,
    },
    SubAgent { agent: String },
}

fn default_transport() -> TransportKind {
    TransportKind::Ephemeral
}

fn default_enabled() -> bool {
    true
}

/// Catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ToolDescriptor {
    pub id: String,
    pub name: String,
    pub kind: ToolKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Catalog default; sessions may override.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub description: String,
    /// JSON Schema for the call arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    pub binding: ToolBinding,
}

impl ToolDescriptor {
    /// Checks that `kind` and `binding` agree.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::validation("tool id cannot be empty"));
        }
        let consistent = matches!(
            (self.kind, &self.binding),
            (ToolKind::BuiltIn | ToolKind::Custom, ToolBinding::Local { .. })
                | (ToolKind::Remote, ToolBinding::Remote { .. })
                | (ToolKind::SubAgent, ToolBinding::SubAgent { .. })
        );
        if !consistent {
            return Err(Error::validation(format!(
                "tool {}: binding does not match kind {:?}",
                self.id, self.kind
            )));
        }
        Ok(())
    }

    pub fn remote_target(&self) -> Option<RemoteTarget> {
        match &self.binding {
            ToolBinding::Remote {
                endpoint,
                transport,
                headers,
                sign,
            } => Some(RemoteTarget {
                endpoint: endpoint.clone(),
                transport: *transport,
                headers: headers.clone(),
                sign: *sign,
            }),
            _ => None,
        }
    }

    /// Function spec handed to the model.
    pub fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.id.clone(),
            description: self.description.clone(),
            parameters: self
                .input_schema
                .clone()
                .unwrap_or_else(|| serde_json::json!({"type": "object"})),
        }
    }
}

/// What the model sees of a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

// =============================================================================
// Overlay
// =============================================================================

/// Per-session enablement overrides keyed by tool id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOverlay {
    overrides: HashMap<String, bool>,
}

impl ToolOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tool_id: &str) -> Option<bool> {
        self.overrides.get(tool_id).copied()
    }

    pub fn set(&mut self, tool_id: impl Into<String>, enabled: bool) {
        self.overrides.insert(tool_id.into(), enabled);
    }

    pub fn is_empty(&self) -> bool {
        self.overrides.is_empty()
    }
}

// =============================================================================
// Catalog
// =============================================================================

#[derive(Debug, Default)]
pub struct ToolCatalog {
    entries: HashMap<String, Arc<ToolDescriptor>>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_descriptors(descriptors: impl IntoIterator<Item = ToolDescriptor>) -> Result<Self> {
        let mut catalog = Self::new();
        for descriptor in descriptors {
            catalog.register(descriptor)?;
        }
        Ok(catalog)
    }

    /// Register a descriptor. Ids are unique; re-registering is an error.
    pub fn register(&mut self, descriptor: ToolDescriptor) -> Result<()> {
        descriptor.validate()?;
        if self.entries.contains_key(&descriptor.id) {
            return Err(Error::validation(format!("duplicate tool id: {}", descriptor.id)));
        }
        self.entries
            .insert(descriptor.id.clone(), Arc::new(descriptor));
        Ok(())
    }

    pub fn get(&self, tool_id: &str) -> Option<&Arc<ToolDescriptor>> {
        self.entries.get(tool_id)
    }

    pub fn contains(&self, tool_id: &str) -> bool {
        self.entries.contains_key(tool_id)
    }

    /// Entries sorted by id.
    pub fn entries(&self) -> Vec<&Arc<ToolDescriptor>> {
        let mut entries: Vec<_> = self.entries.values().collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    /// Enabled state after applying `overlay`.
    pub fn is_enabled(&self, tool_id: &str, overlay: &ToolOverlay) -> Option<bool> {
        let entry = self.entries.get(tool_id)?;
        Some(overlay.get(tool_id).unwrap_or(entry.enabled))
    }

    /// Catalog as seen by one session: `enabled` reflects the overlay.
    pub fn view(&self, overlay: &ToolOverlay) -> Vec<ToolDescriptor> {
        self.entries()
            .into_iter()
            .map(|entry| {
                let mut descriptor = ToolDescriptor::clone(entry);
                descriptor.enabled = overlay.get(&entry.id).unwrap_or(entry.enabled);
                descriptor
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
