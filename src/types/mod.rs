//! Core types shared by every subsystem.
//!
//! - **IDs**: Strongly-typed identifiers (SessionId, RunId, ToolCallId)
//! - **Errors**: Application error taxonomy with thiserror derives
//! - **Config**: Configuration structures for sessions, pool, signing and pipeline

mod config;
mod errors;
mod ids;

pub use config::{
    Config, ModelConfig, ObservabilityConfig, PipelineConfig, PoolConfig, ProtectedEndpoint,
    ServerConfig, SessionConfig, SigningConfig,
};
pub use errors::{Error, Result};
pub use ids::{RunId, SessionId, ToolCallId, SESSION_ID_BYTES};
