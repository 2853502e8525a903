//! Configuration structures.
//!
//! Configuration is loaded from a JSON file and then overridden from
//! environment variables. Every section has defaults, so an empty object is a
//! valid config.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use super::errors::{Error, Result};
use crate::agent::AgentProfile;
use crate::tools::{ToolBinding, ToolDescriptor};

/// Global configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, JsonSchema)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,

    #[serde(default)]
    pub sessions: SessionConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub signing: SigningConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub model: ModelConfig,

    /// Static tool catalog.
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,

    /// Named agent profiles reachable through SubAgent tools.
    #[serde(default)]
    pub agents: HashMap<String, AgentProfile>,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP bind address.
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error). `RUST_LOG` wins.
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Session registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SessionConfig {
    /// Contexts idle longer than this are swept.
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub inactivity_timeout: Duration,

    /// How often the background sweeper runs.
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub sweep_interval: Duration,

    /// Answer unknown or expired ids with `not_found` instead of minting a
    /// fresh session.
    pub reject_unknown: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(30),
            reject_unknown: false,
        }
    }
}

/// Connection pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct PoolConfig {
    /// Upper bound for a single remote call.
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub call_timeout: Duration,

    /// Upper bound for establishing a connection (including handshake).
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub connect_timeout: Duration,

    /// Consecutive failures after which a pooled connection is evicted.
    pub max_consecutive_failures: u32,

    /// Retries after the first attempt for transient failures.
    pub max_retries: u32,

    /// First retry delay; doubles per attempt.
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub retry_backoff_base: Duration,

    /// Cooldown after the first eviction of a key; doubles per eviction.
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub eviction_backoff_base: Duration,

    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub eviction_backoff_max: Duration,

    /// Connections unused for longer than this are retired.
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            max_consecutive_failures: 4,
            max_retries: 2,
            retry_backoff_base: Duration::from_millis(200),
            eviction_backoff_base: Duration::from_secs(1),
            eviction_backoff_max: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// A host pattern whose traffic must be signed.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ProtectedEndpoint {
    /// Host glob, `*` matches within and across labels (`*.lambda-url.*.on.aws`).
    pub pattern: String,

    /// Signing service name for the credential scope.
    pub service: String,

    /// Region override; inferred from the host when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

/// Request signing configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SigningConfig {
    pub protected: Vec<ProtectedEndpoint>,

    /// Region used when neither the rule nor the host names one.
    pub default_region: String,

    /// How long a produced signature is considered valid.
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub signature_ttl: Duration,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            protected: vec![
                ProtectedEndpoint {
                    pattern: "*.lambda-url.*.on.aws".to_string(),
                    service: "lambda".to_string(),
                    region: None,
                },
                ProtectedEndpoint {
                    pattern: "bedrock-agentcore.*.amazonaws.com".to_string(),
                    service: "bedrock-agentcore".to_string(),
                    region: None,
                },
            ],
            default_region: "us-east-1".to_string(),
            signature_ttl: Duration::from_secs(300),
        }
    }
}

/// Event pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct PipelineConfig {
    /// Bounded channel capacity between a run and its client stream.
    pub channel_capacity: usize,

    /// Time a cancelled run gets to release remote calls before it is dropped.
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub cancel_grace: Duration,

    /// Model turns per run.
    pub max_iterations: u32,

    /// Nesting bound for SubAgent tools.
    pub max_subagent_depth: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
            cancel_grace: Duration::from_secs(2),
            max_iterations: 8,
            max_subagent_depth: 2,
        }
    }
}

/// Inference backend configuration (OpenAI-compatible).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ModelConfig {
    pub base_url: String,
    pub model: String,

    /// Secret reference (`ref://name`) for the API key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_ref: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_ref: Some("ref://openai_api_key".to_string()),
            system_prompt: None,
        }
    }
}

impl Config {
    /// Load a JSON config file and validate it.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `SWITCHBOARD_*` environment overrides.
    pub fn apply_env(&mut self) {
        if let Ok(addr) = std::env::var("SWITCHBOARD_LISTEN_ADDR") {
            self.server.listen_addr = addr;
        }
        if let Ok(level) = std::env::var("SWITCHBOARD_LOG_LEVEL") {
            self.observability.log_level = level;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for tool in &self.tools {
            tool.validate()?;
            if !seen.insert(tool.id.as_str()) {
                return Err(Error::validation(format!("duplicate tool id: {}", tool.id)));
            }
            if let ToolBinding::SubAgent { agent } = &tool.binding {
                if !self.agents.contains_key(agent) {
                    return Err(Error::validation(format!(
                        "tool {} references unknown agent profile {}",
                        tool.id, agent
                    )));
                }
            }
        }
        if self.pool.max_consecutive_failures == 0 {
            return Err(Error::validation("pool.max_consecutive_failures must be > 0"));
        }
        if self.pipeline.channel_capacity == 0 {
            return Err(Error::validation("pipeline.channel_capacity must be > 0"));
        }
        if self.pipeline.max_iterations == 0 {
            return Err(Error::validation("pipeline.max_iterations must be > 0"));
        }
        Ok(())
    }

    /// JSON Schema describing the config file.
    pub fn json_schema() -> serde_json::Value {
        let schema = schemars::schema_for!(Config);
        serde_json::to_value(schema).unwrap_or(serde_json::Value::Null)
    }
}
