// Volatile state shared by the batching engine: per-chat pending queues,
// flush leases, idempotency entries and the latest-root cache.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub mod keys;
mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

#[derive(Debug, Error)]
pub enum VolatileError {
    #[error("redis failure: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("volatile backend unavailable: {0}")]
    Unavailable(String),
}

/// Queue, lease and keyed-value operations backing the batching engine.
///
/// Queue values are ASCII-decimal message ids. A missing list and an empty
/// list are indistinguishable; popping either yields `None`. Errors mean the
/// backend could not be reached, never "not found".
#[async_trait]
pub trait VolatileStore: Send + Sync {
    /// Append a value to the tail of the list at `key`, creating it lazily.
    async fn push_right(&self, key: &str, value: &str) -> Result<(), VolatileError>;

    /// Prepend a value to the head of the list at `key`. Used to restore
    /// drained ids when a flush aborts.
    async fn push_left(&self, key: &str, value: &str) -> Result<(), VolatileError>;

    /// Remove and return the head of the list at `key`, or `None` when the
    /// list is empty.
    async fn pop_left(&self, key: &str) -> Result<Option<String>, VolatileError>;

    /// Current length of the list at `key` (0 when absent).
    async fn list_len(&self, key: &str) -> Result<u64, VolatileError>;

    /// Whether `value` is currently an element of the list at `key`.
    async fn list_contains(&self, key: &str, value: &str) -> Result<bool, VolatileError>;

    /// Atomic set-if-absent with expiry. Returns `true` when this caller now
    /// holds the lease, `false` when a live holder already exists.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool, VolatileError>;

    /// Unconditionally drop a lease. Best-effort; the TTL is the safety net.
    async fn release(&self, key: &str) -> Result<(), VolatileError>;

    /// Store a value with no expiry.
    async fn set(&self, key: &str, value: &[u8]) -> Result<(), VolatileError>;

    /// Store a value that expires after `ttl`.
    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration)
        -> Result<(), VolatileError>;

    /// Fetch a value, `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, VolatileError>;
}
