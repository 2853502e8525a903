//! Session Registry: lookup, lazy creation and expiry of session contexts.
//!
//! Session ids are capability tokens used for lookup only. Whoever presents a
//! live id gets that context; binding ids to an authenticated identity is the
//! job of whatever terminates authentication in front of this service.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::context::SessionContext;
use crate::agent::Agent;
use crate::types::{Error, Result, SessionConfig, SessionId};

/// Whether `resolve` found the requested context or minted a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Resumed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Created => "created",
            SessionStatus::Resumed => "resumed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedSession {
    pub context: Arc<SessionContext>,
    pub status: SessionStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub live: usize,
    pub active_runs: usize,
    pub created_total: u64,
    pub expired_total: u64,
}

#[derive(Debug)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<SessionContext>>>,
    config: SessionConfig,
    /// Cloned into every new context so each session owns its own agent.
    agent: Agent,
    created_total: AtomicU64,
    expired_total: AtomicU64,
}

impl SessionRegistry {
    pub fn new(config: SessionConfig, agent: Agent) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
            agent,
            created_total: Default::default(),
            expired_total: Default::default(),
        }
    }

    fn is_expired(&self, context: &SessionContext) -> bool {
        context.active_runs() == 0 && context.idle_for() > self.config.inactivity_timeout
    }

    /// Find a live context for `candidate` or mint a new one.
    ///
    /// Unknown and expired ids are replaced by a fresh session unless
    /// `reject_unknown` is set, in which case they fail with `NotFound`.
    pub async fn resolve(&self, candidate: Option<&str>) -> Result<ResolvedSession> {
        if let Some(raw) = candidate {
            if let Some(id) = SessionId::parse(raw) {
                let found = self.sessions.read().await.get(&id).cloned();
                if let Some(context) = found {
                    if !self.is_expired(&context) {
                        context.touch();
                        debug!(session_id = %id, "session resumed");
                        return Ok(ResolvedSession {
                            context,
                            status: SessionStatus::Resumed,
                        });
                    }
                    self.remove_if_expired(&id).await;
                }
            }
            if self.config.reject_unknown {
                return Err(Error::not_found("session unknown or expired"));
            }
        }
        Ok(ResolvedSession {
            context: self.create().await,
            status: SessionStatus::Created,
        })
    }

    /// Existing live context, without creating one.
    pub async fn lookup(&self, id: &str) -> Result<Arc<SessionContext>> {
        let not_found = || Error::not_found("session unknown or expired");
        let id = SessionId::parse(id).ok_or_else(not_found)?;
        let context = self.sessions.read().await.get(&id).cloned().ok_or_else(not_found)?;
        if self.is_expired(&context) {
            self.remove_if_expired(&id).await;
            return Err(not_found());
        }
        Ok(context)
    }

    async fn create(&self) -> Arc<SessionContext> {
        let mut sessions = self.sessions.write().await;
        let id = loop {
            let id = SessionId::generate();
            if !sessions.contains_key(&id) {
                break id;
            }
        };
        let context = Arc::new(SessionContext::new(id.clone(), self.agent.clone()));
        sessions.insert(id.clone(), Arc::clone(&context));
        self.created_total
            .fetch_add(1, Ordering::Relaxed);
        info!(session_id = %id, live = sessions.len(), "session created");
        context
    }

    async fn remove_if_expired(&self, id: &SessionId) {
        let mut sessions = self.sessions.write().await;
        // re-check under the write lock: a request may have touched it meanwhile
        if sessions.get(id).is_some_and(|c| self.is_expired(c)) {
            sessions.remove(id);
            self.expired_total
                .fetch_add(1, Ordering::Relaxed);
            info!(session_id = %id, "session expired");
        }
    }

    pub async fn touch(&self, id: &SessionId) -> bool {
        match self.sessions.read().await.get(id) {
            Some(context) => {
                context.touch();
                true
            }
            None => false,
        }
    }

    /// Remove idle contexts. Contexts with an active run are kept regardless
    /// of idle time.
    pub async fn expire(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|id, context| {
            let expired = self.is_expired(context);
            if expired {
                info!(session_id = %id, idle_secs = context.idle_for().as_secs(), "session expired");
            }
            !expired
        });
        let removed = before - sessions.len();
        self.expired_total
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Explicit teardown; cancels an in-flight run. Idempotent.
    pub async fn destroy(&self, id: &str) -> bool {
        let Some(id) = SessionId::parse(id) else {
            return false;
        };
        let removed = self.sessions.write().await.remove(&id);
        match removed {
            Some(context) => {
                context.abort();
                info!(session_id = %id, "session destroyed");
                true
            }
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn stats(&self) -> SessionStats {
        let sessions = self.sessions.read().await;
        SessionStats {
            live: sessions.len(),
            active_runs: sessions.values().map(|c| c.active_runs()).sum(),
            created_total: self
                .created_total
                .load(Ordering::Relaxed),
            expired_total: self
                .expired_total
                .load(Ordering::Relaxed),
        }
    }
}
