//! Secret resolution for indirection references.
//!
//! Endpoint strings and API keys may be written as `ref://name`; the
//! [`SecretResolver`] collaborator turns the name into the literal value.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::types::{Error, Result};

/// Scheme marker for indirection references.
pub const REFERENCE_SCHEME: &str = "ref://";

/// Key → value lookup service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SecretResolver: Send + Sync + std::fmt::Debug {
    async fn lookup(&self, name: &str) -> Result<String>;
}

/// Returns the reference name if `value` is an indirection reference.
pub fn reference_name(value: &str) -> Option<&str> {
    value
        .strip_prefix(REFERENCE_SCHEME)
        .filter(|name| !name.is_empty())
}

/// Resolve `value` through `resolver` if it is a reference, else return it as is.
pub async fn resolve_value(resolver: &dyn SecretResolver, value: &str) -> Result<String> {
    match reference_name(value) {
        Some(name) => resolver.lookup(name).await,
        None if value.starts_with(REFERENCE_SCHEME) => {
            Err(Error::unresolvable("empty secret reference"))
        }
        None => Ok(value.to_string()),
    }
}

/// Resolves `ref://some.name` to env var `PREFIX` + `SOME_NAME`.
#[derive(Debug, Clone, Default)]
pub struct EnvSecretResolver {
    prefix: String,
}

impl EnvSecretResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn var_name(&self, name: &str) -> String {
        let normalized: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}{}", self.prefix, normalized)
    }
}

#[async_trait]
impl SecretResolver for EnvSecretResolver {
    async fn lookup(&self, name: &str) -> Result<String> {
        let var = self.var_name(name);
        std::env::var(&var)
            .map_err(|_| Error::unresolvable(format!("secret reference {} is not set", name)))
    }
}

/// In-memory resolver for embedders and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticSecretResolver {
    values: HashMap<String, String>,
}

impl StaticSecretResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }
}

#[async_trait]
impl SecretResolver for StaticSecretResolver {
    async fn lookup(&self, name: &str) -> Result<String> {
        self.values
            .get(name)
            .cloned()
            .ok_or_else(|| Error::unresolvable(format!("unknown secret reference {}", name)))
    }
}
