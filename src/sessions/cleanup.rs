//! Background sweeper.
//!
//! Periodically expires idle sessions and retires idle pooled connections.
//! The two are independent: expiring a session never closes a connection.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use super::registry::SessionRegistry;
use crate::connections::ConnectionManager;

/// Statistics from one sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepStats {
    pub sessions_expired: usize,
    pub connections_retired: usize,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct Sweeper {
    sessions: Arc<SessionRegistry>,
    pool: Arc<ConnectionManager>,
    every: Duration,
    stop_tx: Option<oneshot::Sender<()>>,
}

impl Sweeper {
    pub fn new(sessions: Arc<SessionRegistry>, pool: Arc<ConnectionManager>, every: Duration) -> Self {
        Self {
            sessions,
            pool,
            every,
            stop_tx: None,
        }
    }

    /// Spawn the sweep loop. Returns immediately.
    pub fn start(&mut self) -> JoinHandle<()> {
        let sessions = Arc::clone(&self.sessions);
        let pool = Arc::clone(&self.pool);
        let every = self.every;
        let (stop_tx, mut stop_rx) = oneshot::channel();
        self.stop_tx = Some(stop_tx);

        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick fires immediately; nothing can be idle yet
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        Self::sweep(&sessions, &pool).await;
                    }
                    _ = &mut stop_rx => {
                        tracing::info!("sweeper stopped");
                        break;
                    }
                }
            }
        })
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Run a single sweep.
    pub async fn sweep(sessions: &SessionRegistry, pool: &ConnectionManager) -> SweepStats {
        let stats = SweepStats {
            sessions_expired: sessions.expire().await,
            connections_retired: pool.retire_idle().await,
            completed_at: Some(Utc::now()),
        };
        if stats.sessions_expired > 0 || stats.connections_retired > 0 {
            tracing::debug!(
                sessions_expired = stats.sessions_expired,
                connections_retired = stats.connections_retired,
                "sweep completed"
            );
        }
        stats
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.stop();
    }
}
