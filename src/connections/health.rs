//! Connection health and per-key eviction backoff.
//!
//! A pooled connection counts consecutive failures; crossing the threshold
//! evicts it. Each eviction puts the pool key into a cooldown that doubles
//! with every further eviction, so a dead server is not hammered with
//! reconnects.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Liveness of a single pooled connection.
#[derive(Debug)]
pub struct ConnectionHealth {
    consecutive_failures: AtomicU32,
    healthy: AtomicBool,
}

impl Default for ConnectionHealth {
    fn default() -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            healthy: AtomicBool::new(true),
        }
    }
}

impl ConnectionHealth {
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
    }

    /// Returns the failure streak including this failure.
    pub fn record_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    pub fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::Release);
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }
}

/// Eviction streak and cooldown for one pool key.
#[derive(Debug, Default, Clone)]
pub struct KeyBackoff {
    evictions: u32,
    cooldown_until: Option<Instant>,
}

impl KeyBackoff {
    /// Register an eviction (or failed establishment) and start the cooldown.
    pub fn strike(&mut self, now: Instant, base: Duration, max: Duration) -> Duration {
        self.evictions = self.evictions.saturating_add(1);
        let exponent = self.evictions.saturating_sub(1).min(16);
        let delay = base.saturating_mul(1u32 << exponent).min(max);
        self.cooldown_until = Some(now + delay);
        delay
    }

    /// Remaining cooldown, if the key is not yet eligible.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.cooldown_until
            .and_then(|until| until.checked_duration_since(now))
            .filter(|d| !d.is_zero())
    }

    /// A successful call ends the streak.
    pub fn reset(&mut self) {
        self.evictions = 0;
        self.cooldown_until = None;
    }

    pub fn evictions(&self) -> u32 {
        self.evictions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_streak_resets_on_success() {
        let health = ConnectionHealth::default();
        assert_eq!(health.record_failure(), 1);
        assert_eq!(health.record_failure(), 2);
        health.record_success();
        assert_eq!(health.consecutive_failures(), 0);
        assert!(health.is_healthy());
        health.mark_unhealthy();
        assert!(!health.is_healthy());
    }

    #[test]
    fn cooldown_doubles_and_caps() {
        let now = Instant::now();
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(5);
        let mut backoff = KeyBackoff::default();
        assert_eq!(backoff.strike(now, base, max), Duration::from_secs(1));
        assert_eq!(backoff.strike(now, base, max), Duration::from_secs(2));
        assert_eq!(backoff.strike(now, base, max), Duration::from_secs(4));
        assert_eq!(backoff.strike(now, base, max), Duration::from_secs(5));
        assert_eq!(backoff.evictions(), 4);
    }

    #[test]
    fn eligibility_after_cooldown() {
        let now = Instant::now();
        let mut backoff = KeyBackoff::default();
        assert!(backoff.remaining(now).is_none());
        backoff.strike(now, Duration::from_secs(10), Duration::from_secs(60));
        assert!(backoff.remaining(now).is_some());
        assert!(backoff.remaining(now + Duration::from_secs(11)).is_none());
        backoff.reset();
        assert!(backoff.remaining(now).is_none());
    }

    #[test]
    fn zero_base_never_blocks() {
        let now = Instant::now();
        let mut backoff = KeyBackoff::default();
        backoff.strike(now, Duration::ZERO, Duration::from_secs(60));
        assert!(backoff.remaining(now).is_none());
    }
}
