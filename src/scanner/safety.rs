//! Kill switch and circuit breaker gate.
//!
//! Both services are optional. Without a service, or without a user to ask
//! about, the gate reports "inactive". When a lookup fails the gate returns
//! the default fixed at construction: `fail_safe = true` halts scanning,
//! `false` lets it continue.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Manually operated override that halts scanning until reset.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KillSwitch: Send + Sync {
    async fn is_active(&self, user_id: &str) -> anyhow::Result<bool>;
}

/// Automatic health override that pauses a single cycle.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CircuitBreaker: Send + Sync {
    async fn is_open(&self, user_id: &str) -> anyhow::Result<bool>;
}

/// Short-lived kill-switch result owned by one cycle.
#[derive(Debug, Default)]
pub struct KillSwitchCache {
    entry: Option<(bool, Instant)>,
}

impl KillSwitchCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached value if it is younger than `ttl`.
    pub fn get(&self, ttl: Duration) -> Option<bool> {
        self.entry
            .filter(|(_, stored_at)| stored_at.elapsed() < ttl)
            .map(|(value, _)| value)
    }

    pub fn store(&mut self, value: bool) {
        self.entry = Some((value, Instant::now()));
    }
}

/// Wraps the kill switch and circuit breaker with a uniform error contract.
#[derive(Clone)]
pub struct SafetyGate {
    kill_switch: Option<Arc<dyn KillSwitch>>,
    circuit_breaker: Option<Arc<dyn CircuitBreaker>>,
    user_id: Option<String>,
    fail_safe: bool,
    cache_ttl: Duration,
}

impl SafetyGate {
    /// Create a gate with no services attached.
    pub fn new(user_id: Option<String>, fail_safe: bool, cache_ttl: Duration) -> Self {
        Self {
            kill_switch: None,
            circuit_breaker: None,
            user_id,
            fail_safe,
            cache_ttl,
        }
    }

    /// A gate that never blocks.
    pub fn disabled() -> Self {
        Self::new(None, true, Duration::from_secs(5))
    }

    pub fn with_kill_switch(mut self, kill_switch: Arc<dyn KillSwitch>) -> Self {
        self.kill_switch = Some(kill_switch);
        self
    }

    pub fn with_circuit_breaker(mut self, circuit_breaker: Arc<dyn CircuitBreaker>) -> Self {
        self.circuit_breaker = Some(circuit_breaker);
        self
    }

    /// Whether the kill switch is active, reusing `cache` when fresh.
    pub async fn check_kill_switch(&self, cache: &mut KillSwitchCache) -> bool {
        let (Some(kill_switch), Some(user_id)) = (&self.kill_switch, &self.user_id) else {
            return false;
        };

        if let Some(active) = cache.get(self.cache_ttl) {
            return active;
        }

        let active = match kill_switch.is_active(user_id).await {
            Ok(active) => active,
            Err(e) => {
                error!(
                    user_id = %user_id,
                    error = %e,
                    fallback = self.fail_safe,
                    "Kill switch lookup failed"
                );
                self.fail_safe
            }
        };

        if active {
            warn!(user_id = %user_id, "Kill switch is active");
        } else {
            debug!(user_id = %user_id, "Kill switch inactive");
        }

        cache.store(active);
        active
    }

    /// Whether the circuit breaker is open. Never cached.
    pub async fn check_circuit_breaker(&self) -> bool {
        let (Some(breaker), Some(user_id)) = (&self.circuit_breaker, &self.user_id) else {
            return false;
        };

        match breaker.is_open(user_id).await {
            Ok(open) => {
                if open {
                    warn!(user_id = %user_id, "Circuit breaker is open");
                }
                open
            }
            Err(e) => {
                error!(
                    user_id = %user_id,
                    error = %e,
                    fallback = self.fail_safe,
                    "Circuit breaker lookup failed"
                );
                self.fail_safe
            }
        }
    }
}
