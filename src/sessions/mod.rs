//! Session isolation.
//!
//! Each context owns its agent, history and tool overlay exclusively and is
//! driven by at most one run at a time. The connection pool is shared across
//! sessions and is never touched by session teardown.

pub mod cleanup;
pub mod context;
pub mod registry;

pub use cleanup::{SweepStats, Sweeper};
pub use context::{RunGuard, SessionContext, SessionState};
pub use registry::{ResolvedSession, SessionRegistry, SessionStats, SessionStatus};
