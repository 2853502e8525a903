//! Per-conversation execution context.

use chrono::{DateTime, Utc};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::agent::{Agent, Message};
use crate::tools::ToolOverlay;
use crate::types::{Error, Result, SessionId};

/// State touched only by the session's single active run.
#[derive(Debug)]
pub struct SessionState {
    pub agent: Agent,
    pub history: Vec<Message>,
    /// Next sequence number to hand out; sequences continue across runs.
    pub next_sequence: u64,
}

pub struct SessionContext {
    id: SessionId,
    created_at: DateTime<Utc>,
    last_activity: Mutex<Instant>,
    active_runs: AtomicUsize,
    overlay: RwLock<ToolOverlay>,
    state: Arc<tokio::sync::Mutex<SessionState>>,
    current_run: Mutex<Option<CancellationToken>>,
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("active_runs", &self.active_runs())
            .finish_non_exhaustive()
    }
}

impl SessionContext {
    pub(crate) fn new(id: SessionId, agent: Agent) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            last_activity: Mutex::new(Instant::now()),
            active_runs: AtomicUsize::new(0),
            overlay: RwLock::new(ToolOverlay::new()),
            state: Arc::new(tokio::sync::Mutex::new(SessionState {
                agent,
                history: Vec::new(),
                next_sequence: 1,
            })),
            current_run: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn touch(&self) {
        if let Ok(mut at) = self.last_activity.lock() {
            *at = Instant::now();
        }
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_activity
            .lock()
            .map(|at| at.elapsed())
            .unwrap_or_default()
    }

    pub fn active_runs(&self) -> usize {
        self.active_runs.load(Ordering::Acquire)
    }

    /// Snapshot of the tool-enablement overlay.
    pub fn overlay(&self) -> ToolOverlay {
        self.overlay
            .read()
            .map(|o| o.clone())
            .unwrap_or_default()
    }

    pub fn update_overlay<T>(&self, f: impl FnOnce(&mut ToolOverlay) -> Result<T>) -> Result<T> {
        let mut overlay = self
            .overlay
            .write()
            .map_err(|_| Error::internal("session overlay poisoned"))?;
        f(&mut overlay)
    }

    /// Claim the session for one run. Fails with `Busy` while another run
    /// holds it.
    pub fn begin_run(self: &Arc<Self>) -> Result<RunGuard> {
        let state = Arc::clone(&self.state)
            .try_lock_owned()
            .map_err(|_| Error::busy(format!("session {} already has an active run", self.id)))?;
        self.active_runs.fetch_add(1, Ordering::AcqRel);
        let cancel = CancellationToken::new();
        if let Ok(mut current) = self.current_run.lock() {
            *current = Some(cancel.clone());
        }
        self.touch();
        Ok(RunGuard {
            context: Arc::clone(self),
            state,
            cancel,
        })
    }

    /// Cancel the in-flight run, if any.
    pub fn abort(&self) -> bool {
        match self.current_run.lock().ok().and_then(|c| c.clone()) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Conversation history, waiting for an active run to finish.
    pub async fn history(&self) -> Vec<Message> {
        self.state.lock().await.history.clone()
    }
}

/// Exclusive access to a session's state for the duration of one run.
pub struct RunGuard {
    context: Arc<SessionContext>,
    state: OwnedMutexGuard<SessionState>,
    cancel: CancellationToken,
}

impl fmt::Debug for RunGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunGuard")
            .field("session", &self.context.id)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl RunGuard {
    pub fn session(&self) -> &Arc<SessionContext> {
        &self.context
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Deref for RunGuard {
    type Target = SessionState;

    fn deref(&self) -> &SessionState {
        &self.state
    }
}

impl DerefMut for RunGuard {
    fn deref_mut(&mut self) -> &mut SessionState {
        &mut self.state
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if let Ok(mut current) = self.context.current_run.lock() {
            *current = None;
        }
        self.context.active_runs.fetch_sub(1, Ordering::AcqRel);
        self.context.touch();
    }
}
