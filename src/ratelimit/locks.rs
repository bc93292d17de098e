//! Per-identifier serialization within one process.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use tokio::sync::{Mutex, MutexGuard};

/// Default number of lock shards.
pub const DEFAULT_SHARDS: usize = 64;

/// A fixed table of async locks indexed by a hash of the identifier.
///
/// Calls for the same identifier always land on the same shard and run one
/// at a time. Distinct identifiers only wait on each other when they hash to
/// the same shard.
pub struct LockShards {
    shards: Box<[Mutex<()>]>,
}

impl LockShards {
    /// Create a table with `count` shards (at least one).
    pub fn new(count: usize) -> Self {
        let shards = (0..count.max(1)).map(|_| Mutex::new(())).collect();
        Self { shards }
    }

    /// Index of the shard guarding `identifier`.
    pub fn shard_index(&self, identifier: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        identifier.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    /// Wait for the lock guarding `identifier`.
    pub async fn lock(&self, identifier: &str) -> MutexGuard<'_, ()> {
        self.shards[self.shard_index(identifier)].lock().await
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}

impl Default for LockShards {
    fn default() -> Self {
        Self::new(DEFAULT_SHARDS)
    }
}

impl std::fmt::Debug for LockShards {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockShards")
            .field("shards", &self.shards.len())
            .finish()
    }
}
