//! # Switchboard - Tool & Session Orchestration Core
//!
//! Provides:
//! - Isolated, expiring conversational sessions with one run at a time
//! - A uniform invocation contract over built-in, custom, remote and
//!   sub-agent tools
//! - Pooled, signed, health-tracked connections to remote tool servers over
//!   ephemeral (request/response) and persistent (session) transports
//! - An ordered, cancellable event stream per agent run
//!
//! ## Architecture
//!
//! ```text
//!   client ──HTTP──▶ SessionRegistry ──▶ SessionContext (agent, history, overlay)
//!                                              │
//!                                        EventPipeline ──SSE──▶ client
//!                                              │
//!                                        Agent ──▶ ToolRegistry ──▶ local / sub-agent
//!                                                        │
//!                                                  ConnectionManager (shared pool)
//!                                                        │ RequestSigner
//!                                                        ▼
//!                                                  remote tool servers
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]

pub mod agent;
pub mod connections;
pub mod events;
pub mod http;
pub mod runtime;
pub mod secrets;
pub mod sessions;
pub mod signing;
pub mod tools;
pub mod types;

// Internal utilities
pub mod observability;

pub use runtime::{Runtime, RuntimeParts};
pub use types::{Config, Error, Result};
