//! In-process tools for the BuiltIn and Custom kinds.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::types::{Error, Result};

/// A locally callable tool. Knows nothing about networks or sessions.
#[async_trait]
pub trait LocalTool: Send + Sync + fmt::Debug {
    async fn call(&self, arguments: Value) -> Result<Value>;
}

/// Lookup key for a local binding.
pub fn binding_key(module: &str, symbol: &str) -> String {
    format!("{}::{}", module, symbol)
}

/// Registry of local callables keyed by `module::symbol`.
#[derive(Debug, Default, Clone)]
pub struct LocalToolTable {
    tools: HashMap<String, Arc<dyn LocalTool>>,
}

impl LocalToolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with `builtin::clock::now` and `builtin::text::echo`.
    pub fn with_builtins() -> Self {
        let mut table = Self::new();
        table.register("builtin::clock", "now", Arc::new(Clock));
        table.register("builtin::text", "echo", Arc::new(Echo));
        table
    }

    pub fn register(&mut self, module: &str, symbol: &str, tool: Arc<dyn LocalTool>) {
        self.tools.insert(binding_key(module, symbol), tool);
    }

    pub fn get(&self, module: &str, symbol: &str) -> Result<Arc<dyn LocalTool>> {
        self.tools
            .get(&binding_key(module, symbol))
            .cloned()
            .ok_or_else(|| {
                Error::unresolvable(format!("no local tool {}", binding_key(module, symbol)))
            })
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Adapter for plain synchronous functions.
pub struct FnTool<F> {
    name: &'static str,
    f: F,
}

impl<F> FnTool<F>
where
    F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
{
    pub fn new(name: &'static str, f: F) -> Self {
        Self { name, f }
    }
}

impl<F> fmt::Debug for FnTool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTool").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F> LocalTool for FnTool<F>
where
    F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
{
    async fn call(&self, arguments: Value) -> Result<Value> {
        (self.f)(arguments)
    }
}

#[derive(Debug)]
struct Clock;

#[async_trait]
impl LocalTool for Clock {
    async fn call(&self, _arguments: Value) -> Result<Value> {
        Ok(json!({"now": Utc::now().to_rfc3339()}))
    }
}

#[derive(Debug)]
struct Echo;

#[async_trait]
impl LocalTool for Echo {
    async fn call(&self, arguments: Value) -> Result<Value> {
        match arguments.get("text") {
            Some(text) => Ok(json!({"text": text})),
            None => Err(Error::validation("echo needs a `text` argument")),
        }
    }
}
