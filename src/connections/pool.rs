//! Shared connection pool keyed by (normalized endpoint, transport kind).
//!
//! The key map is only held long enough to find or insert a slot; each slot
//! has its own async mutex, so establishing a slow handshake for one
//! endpoint never blocks traffic to another. Concurrent `acquire` calls for
//! the same key queue on that slot's mutex and attach to the connection the
//! first caller established.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::endpoint::{
    EndpointClassifier, PoolKey, RemoteTarget, RequestProfile, ResolvedEndpoint,
};
use super::health::{ConnectionHealth, KeyBackoff};
use super::transport::{Connector, Transport};
use crate::secrets::{resolve_value, SecretResolver};
use crate::types::{Error, PoolConfig, Result, ToolCallId};

/// A live transport plus its pool bookkeeping.
#[derive(Debug)]
pub struct PooledConnection {
    id: u64,
    endpoint: ResolvedEndpoint,
    transport: Arc<dyn Transport>,
    last_used: std::sync::Mutex<Instant>,
    health: ConnectionHealth,
    leases: AtomicUsize,
}

impl PooledConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &PoolKey {
        &self.endpoint.key
    }

    pub fn endpoint(&self) -> &ResolvedEndpoint {
        &self.endpoint
    }

    pub fn health(&self) -> &ConnectionHealth {
        &self.health
    }

    /// Concurrent callers currently holding a lease.
    pub fn leases(&self) -> usize {
        self.leases.load(Ordering::Acquire)
    }

    fn touch(&self) {
        if let Ok(mut at) = self.last_used.lock() {
            *at = Instant::now();
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .map(|at| at.elapsed())
            .unwrap_or_default()
    }
}

/// Refcounted handle returned by [`ConnectionManager::acquire`].
///
/// Carries the acquiring descriptor's request profile and its configured
/// endpoint string, which is what error messages name.
#[derive(Debug)]
pub struct ConnectionLease {
    conn: Arc<PooledConnection>,
    profile: RequestProfile,
    label: String,
}

impl ConnectionLease {
    fn new(conn: Arc<PooledConnection>, profile: RequestProfile, label: &str) -> Self {
        conn.leases.fetch_add(1, Ordering::AcqRel);
        conn.touch();
        Self {
            conn,
            profile,
            label: label.to_string(),
        }
    }

    pub fn connection(&self) -> &PooledConnection {
        &self.conn
    }

    pub fn profile(&self) -> &RequestProfile {
        &self.profile
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.conn.leases.fetch_sub(1, Ordering::AcqRel);
        self.conn.touch();
    }
}

#[derive(Debug, Default)]
struct SlotState {
    conn: Option<Arc<PooledConnection>>,
    backoff: KeyBackoff,
}

#[derive(Debug, Default)]
struct Slot {
    state: Mutex<SlotState>,
}

impl Slot {
    /// Nothing pooled and no cooldown pending.
    fn is_vacant(&self, now: Instant) -> bool {
        self.state
            .try_lock()
            .is_ok_and(|state| state.conn.is_none() && state.backoff.remaining(now).is_none())
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Pool keys currently tracked, with or without a live connection.
    pub keys: usize,
    pub connections: usize,
    pub leases: usize,
    pub established_total: u64,
    pub evicted_total: u64,
    pub retired_total: u64,
}

enum InvokeOutcome {
    Done(Result<Value>),
    Cancelled,
    TimedOut,
}

#[derive(Debug)]
pub struct ConnectionManager {
    config: PoolConfig,
    classifier: EndpointClassifier,
    resolver: Arc<dyn SecretResolver>,
    connector: Arc<dyn Connector>,
    slots: RwLock<HashMap<PoolKey, Arc<Slot>>>,
    next_id: AtomicU64,
    established: AtomicU64,
    evicted: AtomicU64,
    retired: AtomicU64,
}

impl ConnectionManager {
    pub fn new(
        config: PoolConfig,
        classifier: EndpointClassifier,
        resolver: Arc<dyn SecretResolver>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            config,
            classifier,
            resolver,
            connector,
            slots: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            established: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            retired: AtomicU64::new(0),
        }
    }

    /// Resolve indirection, normalize and classify a target.
    pub async fn resolve(&self, target: &RemoteTarget) -> Result<ResolvedEndpoint> {
        let literal = resolve_value(self.resolver.as_ref(), &target.endpoint)
            .await
            .map_err(|e| match e {
                Error::UnresolvableBinding(_) => e,
                other => Error::unresolvable(format!("endpoint reference: {}", other)),
            })?;
        self.classifier.resolve(&literal, target)
    }

    async fn slot(&self, key: &PoolKey) -> Arc<Slot> {
        if let Some(slot) = self.slots.read().await.get(key) {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write().await;
        Arc::clone(slots.entry(key.clone()).or_default())
    }

    /// Return the pooled connection for `target`, establishing it if needed.
    pub async fn acquire(&self, target: &RemoteTarget) -> Result<ConnectionLease> {
        let endpoint = self.resolve(target).await?;
        let profile = endpoint.profile();
        let label = target.endpoint.as_str();
        let slot = self.slot(&endpoint.key).await;
        let mut state = slot.state.lock().await;

        if let Some(conn) = state.conn.as_ref().filter(|c| c.health.is_healthy()) {
            return Ok(ConnectionLease::new(Arc::clone(conn), profile, label));
        }
        if let Some(remaining) = state.backoff.remaining(Instant::now()) {
            return Err(Error::unreachable(format!(
                "{} is cooling down for {:?}",
                label, remaining
            )));
        }

        let key = endpoint.key.clone();
        let connected =
            tokio::time::timeout(self.config.connect_timeout, self.connector.connect(&endpoint))
                .await
                .unwrap_or_else(|_| Err(Error::timeout(format!("connecting to {}", label))));
        let transport = match connected {
            Ok(transport) => transport,
            Err(e) => {
                if e.is_transient() {
                    let delay = state.backoff.strike(
                        Instant::now(),
                        self.config.eviction_backoff_base,
                        self.config.eviction_backoff_max,
                    );
                    warn!(endpoint = %key, error = %e, cooldown = ?delay, "connection establishment failed");
                }
                return Err(e);
            }
        };

        let conn = Arc::new(PooledConnection {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            endpoint,
            transport,
            last_used: std::sync::Mutex::new(Instant::now()),
            health: ConnectionHealth::default(),
            leases: AtomicUsize::new(0),
        });
        self.established.fetch_add(1, Ordering::Relaxed);
        info!(endpoint = %key, connection = conn.id, "connection established");
        state.conn = Some(Arc::clone(&conn));
        Ok(ConnectionLease::new(conn, profile, label))
    }

    /// Run one call on a leased connection.
    ///
    /// Cancellation and timeouts notify the transport so the server can
    /// drop the call; the call future stays alive until that notice is sent.
    /// Transient failures count towards eviction. A timeout evicts at once,
    /// and so does an expired remote session, without a cooldown.
    pub async fn invoke(
        &self,
        lease: &ConnectionLease,
        call_id: &ToolCallId,
        payload: Value,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let conn = &lease.conn;
        let call = conn.transport.call(call_id, payload, &lease.profile);
        tokio::pin!(call);
        let deadline = tokio::time::sleep(self.config.call_timeout);
        tokio::pin!(deadline);
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => InvokeOutcome::Cancelled,
            _ = &mut deadline => InvokeOutcome::TimedOut,
            result = &mut call => InvokeOutcome::Done(result),
        };

        let result = match outcome {
            InvokeOutcome::Cancelled => {
                conn.transport.cancel(call_id).await;
                debug!(endpoint = %lease.label, call_id = %call_id, "remote call cancelled");
                return Err(Error::cancelled("tool call cancelled"));
            }
            InvokeOutcome::TimedOut => {
                conn.transport.cancel(call_id).await;
                Err(Error::timeout(format!(
                    "call to {} exceeded {:?}",
                    lease.label, self.config.call_timeout
                )))
            }
            InvokeOutcome::Done(result) => result,
        };

        match &result {
            Ok(_) => {
                conn.health.record_success();
                self.reset_backoff(conn.key()).await;
            }
            Err(Error::Timeout(_)) => {
                conn.health.record_failure();
                self.evict(conn, "call timed out", true).await;
            }
            Err(Error::SessionExpired(_)) => {
                self.evict(conn, "remote session expired", false).await;
            }
            Err(e) if e.is_transient() => {
                let streak = conn.health.record_failure();
                if streak >= self.config.max_consecutive_failures {
                    self.evict(conn, "consecutive failures", true).await;
                } else {
                    debug!(endpoint = %lease.label, streak, error = %e, "call failed");
                }
            }
            Err(_) => {}
        }
        result
    }

    /// acquire + invoke with bounded retries on transient errors.
    pub async fn call(
        &self,
        target: &RemoteTarget,
        call_id: &ToolCallId,
        payload: Value,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let mut attempt: u32 = 0;
        loop {
            let result = match self.acquire(target).await {
                Ok(lease) => self.invoke(&lease, call_id, payload.clone(), cancel).await,
                Err(e) => Err(e),
            };
            match result {
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    attempt += 1;
                    let delay = self
                        .config
                        .retry_backoff_base
                        .saturating_mul(1u32 << (attempt - 1).min(16));
                    warn!(endpoint = %target.endpoint, attempt, error = %e, delay = ?delay, "retrying remote call");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(Error::cancelled("tool call cancelled")),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                other => return other,
            }
        }
    }

    /// Drop `conn` from its slot. `strike` starts the key's cooldown.
    async fn evict(&self, conn: &PooledConnection, reason: &str, strike: bool) {
        conn.health.mark_unhealthy();
        let Some(slot) = self.slots.read().await.get(conn.key()).cloned() else {
            return;
        };
        let removed = {
            let mut state = slot.state.lock().await;
            if state.conn.as_ref().is_some_and(|c| c.id == conn.id) {
                let delay = strike.then(|| {
                    state.backoff.strike(
                        Instant::now(),
                        self.config.eviction_backoff_base,
                        self.config.eviction_backoff_max,
                    )
                });
                warn!(endpoint = %conn.key(), connection = conn.id, reason, cooldown = ?delay, "connection evicted");
                state.conn.take()
            } else {
                None
            }
        };
        if let Some(removed) = removed {
            self.evicted.fetch_add(1, Ordering::Relaxed);
            removed.transport.close().await;
        }
    }

    async fn reset_backoff(&self, key: &PoolKey) {
        if let Some(slot) = self.slots.read().await.get(key).cloned() {
            let mut state = slot.state.lock().await;
            if state.backoff.evictions() > 0 {
                state.backoff.reset();
            }
        }
    }

    /// Close connections idle beyond the configured timeout, then forget
    /// keys left with no connection and no cooldown. Keys busy establishing
    /// or with live leases are skipped.
    pub async fn retire_idle(&self) -> usize {
        let slots: Vec<Arc<Slot>> = self.slots.read().await.values().cloned().collect();
        let mut retired = Vec::new();
        for slot in slots {
            let Ok(mut state) = slot.state.try_lock() else {
                continue;
            };
            let idle = state.conn.as_ref().is_some_and(|c| {
                c.leases() == 0 && c.idle_for() >= self.config.idle_timeout
            });
            if idle {
                if let Some(conn) = state.conn.take() {
                    retired.push(conn);
                }
            }
        }
        for conn in &retired {
            info!(endpoint = %conn.key(), connection = conn.id, "idle connection retired");
            conn.transport.close().await;
        }
        self.retired.fetch_add(retired.len() as u64, Ordering::Relaxed);
        self.prune().await;
        retired.len()
    }

    /// Remove vacant slots nobody else holds. Under the map's write lock no
    /// new holder can appear, so an acquire in progress keeps its slot.
    async fn prune(&self) {
        let now = Instant::now();
        let mut slots = self.slots.write().await;
        let before = slots.len();
        slots.retain(|_, slot| Arc::strong_count(slot) > 1 || !slot.is_vacant(now));
        let pruned = before - slots.len();
        if pruned > 0 {
            debug!(pruned, remaining = slots.len(), "vacant pool keys pruned");
        }
    }

    /// Close every pooled connection.
    pub async fn shutdown(&self) {
        let slots: Vec<Arc<Slot>> = self.slots.write().await.drain().map(|(_, s)| s).collect();
        for slot in slots {
            let conn = slot.state.lock().await.conn.take();
            if let Some(conn) = conn {
                conn.transport.close().await;
            }
        }
        info!("connection pool shut down");
    }

    pub async fn stats(&self) -> PoolStats {
        let slots: Vec<Arc<Slot>> = self.slots.read().await.values().cloned().collect();
        let mut stats = PoolStats {
            keys: slots.len(),
            established_total: self.established.load(Ordering::Relaxed),
            evicted_total: self.evicted.load(Ordering::Relaxed),
            retired_total: self.retired.load(Ordering::Relaxed),
            ..PoolStats::default()
        };
        for slot in slots {
            if let Some(conn) = slot.state.lock().await.conn.as_ref() {
                stats.connections += 1;
                stats.leases += conn.leases();
            }
        }
        stats
    }
}
