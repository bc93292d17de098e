//! In-process counter store.
//!
//! Counters are kept as text, like Redis keeps them, so malformed values
//! surface the same way they would in production. Expiry uses the tokio
//! clock, which lets tests pause and advance time.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::{parse_counter, Admission, CounterStore};
use crate::error::{Result, TollgateError};

#[derive(Debug, Clone)]
struct StoredCounter {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredCounter {
    fn new(value: u64, ttl: Duration) -> Self {
        Self {
            value: value.to_string(),
            expires_at: Some(Instant::now() + ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn remaining(&self, now: Instant) -> Option<Duration> {
        self.expires_at.map(|at| at.saturating_duration_since(now))
    }
}

/// A counter store held in local memory.
///
/// Only suitable for a single process; quotas are not shared.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, StoredCounter>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a raw value without expiry, bypassing integer encoding.
    ///
    /// Intended for seeding fixtures, e.g. a corrupted counter.
    pub fn insert_raw(&self, key: &str, raw: &str) {
        self.entries.insert(
            key.to_string(),
            StoredCounter {
                value: raw.to_string(),
                expires_at: None,
            },
        );
    }

    /// Drop every expired counter.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, counter| !counter.is_expired(now));
        before - self.entries.len()
    }

    /// Number of live counters.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|counter| !counter.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<u64>> {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(counter) if !counter.is_expired(now) => {
                parse_counter(key, &counter.value).map(Some)
            }
            _ => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: u64, ttl: Duration) -> Result<()> {
        self.entries
            .insert(key.to_string(), StoredCounter::new(value, ttl));
        Ok(())
    }

    async fn increment(&self, key: &str) -> Result<u64> {
        let now = Instant::now();
        let mut counter = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(StoredCounter {
                        value: "0".to_string(),
                        expires_at: None,
                    });
                }
                occupied.into_ref()
            }
            Entry::Vacant(vacant) => vacant.insert(StoredCounter {
                value: "0".to_string(),
                expires_at: None,
            }),
        };

        let next = parse_counter(key, &counter.value)?
            .checked_add(1)
            .ok_or_else(|| TollgateError::MalformedCounterValue {
                key: key.to_string(),
                value: counter.value.clone(),
            })?;
        counter.value = next.to_string();
        Ok(next)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let now = Instant::now();
        Ok(self
            .entries
            .get(key)
            .filter(|counter| !counter.is_expired(now))
            .and_then(|counter| counter.remaining(now)))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        if let Some(mut counter) = self.entries.get_mut(key) {
            if !counter.is_expired(now) {
                counter.expires_at = Some(now + ttl);
            }
        }
        Ok(())
    }

    fn is_atomic(&self) -> bool {
        true
    }

    async fn admit(&self, key: &str, capacity: u64, window: Duration) -> Result<Admission> {
        let now = Instant::now();

        // The entry guard holds the shard lock for the whole check-and-increment.
        let mut counter = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(StoredCounter::new(0, window));
                }
                occupied.into_ref()
            }
            Entry::Vacant(vacant) => {
                trace!(key = %key, "Creating counter");
                vacant.insert(StoredCounter::new(0, window))
            }
        };

        let current = parse_counter(key, &counter.value)?;
        if counter.expires_at.is_none() {
            debug!(key = %key, "Counter had no expiry, applying window");
            counter.expires_at = Some(now + window);
        }
        let reset_after = counter.remaining(now);

        if current < capacity {
            let count = current + 1;
            counter.value = count.to_string();
            Ok(Admission {
                admitted: true,
                count,
                reset_after,
            })
        } else {
            Ok(Admission {
                admitted: false,
                count: current,
                reset_after,
            })
        }
    }
}
