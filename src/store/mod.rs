//! Counter store abstraction.
//!
//! The limiter needs a few primitives from its backend: read a counter,
//! create it with an expiry, increment it atomically and re-apply an expiry.
//! Backends that can evaluate the whole check-and-increment in one step
//! override [`CounterStore::admit`] and report it through
//! [`CounterStore::is_atomic`].

mod memory;
mod redis;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

pub use memory::MemoryStore;
pub use self::redis::RedisStore;

/// Outcome of a single admission attempt against one counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// Whether the counter was incremented for this request
    pub admitted: bool,
    /// Counter value after the attempt
    pub count: u64,
    /// Time left in the current window, if the store reports it
    pub reset_after: Option<Duration>,
}

/// Trait for the shared key-value service holding rate limit counters.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Read a counter. Absent keys are `Ok(None)`, not zero.
    async fn get(&self, key: &str) -> Result<Option<u64>>;

    /// Create or overwrite a counter with an expiry.
    async fn set(&self, key: &str, value: u64, ttl: Duration) -> Result<()>;

    /// Atomically add one to a counter and return the new value.
    async fn increment(&self, key: &str) -> Result<u64>;

    /// Remaining lifetime of a counter, `None` if absent or without expiry.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;

    /// Give an existing counter a new expiry. Absent keys are left alone.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Check that the store is reachable.
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    /// Whether [`CounterStore::admit`] is evaluated atomically by the store.
    ///
    /// When this is `false` the limiter serializes calls for the same
    /// identifier locally before calling `admit`.
    fn is_atomic(&self) -> bool {
        false
    }

    /// Admit one request against `key` if its counter is below `capacity`.
    ///
    /// The default composes `get`, `set` and `increment`. Two processes racing
    /// on a fresh or nearly full counter can each pass the check, so this path
    /// may overshoot by one request per racing process.
    ///
    /// The counter can expire between the read and the increment, in which
    /// case `increment` recreates it without a TTL. Any counter left without
    /// an expiry gets the window applied here so it cannot outlive it.
    async fn admit(&self, key: &str, capacity: u64, window: Duration) -> Result<Admission> {
        let current = match self.get(key).await? {
            Some(count) => count,
            None => {
                self.set(key, 0, window).await?;
                0
            }
        };

        let (admitted, count) = if current < capacity {
            (true, self.increment(key).await?)
        } else {
            (false, current)
        };

        let reset_after = match self.ttl(key).await? {
            Some(remaining) => remaining,
            None => {
                self.expire(key, window).await?;
                window
            }
        };

        Ok(Admission {
            admitted,
            count,
            reset_after: Some(reset_after),
        })
    }
}

/// Parse a stored counter, rejecting anything that is not a non-negative
/// integer.
pub(crate) fn parse_counter(key: &str, raw: &str) -> Result<u64> {
    raw.trim()
        .parse::<u64>()
        .map_err(|_| crate::error::TollgateError::MalformedCounterValue {
            key: key.to_string(),
            value: raw.to_string(),
        })
}
