//! Core limiter: one admit/deny decision per call, counted in a shared store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace};

use super::key::CounterKey;
use super::locks::{LockShards, DEFAULT_SHARDS};
use super::policy::RatePolicy;
use crate::config::{default_key_prefix, TollgateConfig};
use crate::error::{Result, TollgateError};
use crate::store::CounterStore;

/// Default deadline for one decision, store round trips included.
const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

/// The result of checking one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request was admitted
    pub allowed: bool,
    /// Counter value after this request
    pub count: u64,
    /// Requests admitted per window
    pub limit: u64,
    /// Requests left in the current window
    pub remaining: u64,
    /// Time until the current window resets
    pub reset_after: Duration,
}

/// Fixed-window rate limiter whose counters live in a [`CounterStore`].
///
/// The first request for an identifier creates its counter at zero with a
/// TTL of one window; the store expires it, which starts the next window.
/// Requests are admitted while the counter is below the policy capacity and
/// each admission increments it by one. Denials never touch the counter.
///
/// This struct is thread-safe and can be shared across tasks and across
/// processes pointing at the same store.
pub struct LimiterStore {
    policy: RatePolicy,
    store: Arc<dyn CounterStore>,
    prefix: String,
    locks: LockShards,
    timeout: Duration,
}

impl LimiterStore {
    /// Create a limiter with the default key prefix and deadline.
    pub fn new(policy: RatePolicy, store: Arc<dyn CounterStore>) -> Self {
        Self {
            policy,
            store,
            prefix: default_key_prefix(),
            locks: LockShards::new(DEFAULT_SHARDS),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Create a limiter from loaded configuration.
    pub fn from_config(config: &TollgateConfig, store: Arc<dyn CounterStore>) -> Result<Self> {
        let policy = RatePolicy::from_config(&config.limits)?;
        Ok(Self::new(policy, store)
            .with_prefix(&config.store.key_prefix)
            .with_timeout(config.store.timeout()))
    }

    /// Namespace for counter keys.
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_string();
        self
    }

    /// Default deadline used by [`LimiterStore::allow`] and [`LimiterStore::check`].
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Number of local lock shards used for non-atomic stores.
    pub fn with_lock_shards(mut self, shards: usize) -> Self {
        self.locks = LockShards::new(shards);
        self
    }

    pub fn policy(&self) -> &RatePolicy {
        &self.policy
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Decide whether a request from `identifier` is admitted.
    ///
    /// Errors mean the request was not admitted; the caller picks the
    /// user-visible policy for them.
    pub async fn allow(&self, identifier: &str) -> Result<bool> {
        self.check(identifier).await.map(|decision| decision.allowed)
    }

    /// Like [`LimiterStore::allow`] with a caller-supplied deadline.
    pub async fn allow_with_deadline(&self, identifier: &str, deadline: Duration) -> Result<bool> {
        self.check_with_deadline(identifier, deadline)
            .await
            .map(|decision| decision.allowed)
    }

    /// Decide and report counter state for `identifier`.
    pub async fn check(&self, identifier: &str) -> Result<Decision> {
        self.check_with_deadline(identifier, self.timeout).await
    }

    /// Like [`LimiterStore::check`] with a caller-supplied deadline.
    ///
    /// When the deadline passes the in-flight store call is dropped and
    /// `TollgateError::Timeout` is returned.
    pub async fn check_with_deadline(&self, identifier: &str, deadline: Duration) -> Result<Decision> {
        let key = CounterKey::new(&self.prefix, identifier);

        trace!(key = %key, "Checking rate limit");

        match tokio::time::timeout(deadline, self.admit(identifier, &key)).await {
            Ok(result) => result,
            Err(_) => {
                debug!(key = %key, deadline = ?deadline, "Rate limit check timed out");
                Err(TollgateError::Timeout(deadline))
            }
        }
    }

    /// Read the stored counter for `identifier` without changing it.
    pub async fn counter_value(&self, identifier: &str) -> Result<Option<u64>> {
        let key = CounterKey::new(&self.prefix, identifier);
        self.store.get(key.as_str()).await
    }

    async fn admit(&self, identifier: &str, key: &CounterKey) -> Result<Decision> {
        // Atomic stores serialize on the server; the rest serialize here.
        let _guard = if self.store.is_atomic() {
            None
        } else {
            Some(self.locks.lock(identifier).await)
        };

        let capacity = self.policy.capacity();
        let admission = self
            .store
            .admit(key.as_str(), capacity, self.policy.window())
            .await?;

        if admission.admitted {
            if admission.count == 1 {
                debug!(
                    key = %key,
                    limit = capacity,
                    window = ?self.policy.window(),
                    "Started new rate limit window"
                );
            }
        } else {
            debug!(
                key = %key,
                count = admission.count,
                limit = capacity,
                "Rate limit exceeded"
            );
        }

        Ok(Decision {
            allowed: admission.admitted,
            count: admission.count,
            limit: capacity,
            remaining: capacity.saturating_sub(admission.count),
            reset_after: admission.reset_after.unwrap_or(self.policy.window()),
        })
    }
}

impl std::fmt::Debug for LimiterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimiterStore")
            .field("policy", &self.policy)
            .field("prefix", &self.prefix)
            .field("locks", &self.locks)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[async_trait]
impl super::backend::RateLimiterBackend for LimiterStore {
    async fn check(&self, identifier: &str) -> Result<Decision> {
        LimiterStore::check(self, identifier).await
    }
}
