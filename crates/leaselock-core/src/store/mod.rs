//! Key-value store adapters
//!
//! The lock protocol only needs a handful of atomic primitives from the
//! shared store. They are captured by the [`LockStore`] trait so the lock
//! layer never depends on a particular backend.
//!
//! # Backends
//!
//! - [`RedisStore`]: production backend (`SET NX PX` plus Lua scripts)
//! - [`MemoryStore`]: in-process backend with TTLs and fault injection

pub mod memory;
pub mod redis;

pub use memory::MemoryStore;
pub use self::redis::RedisStore;

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Store errors
///
/// Every variant means the outcome of the call is unknown to the caller.
/// The lock layer treats all of them as "store unavailable".
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Could not reach the store
    #[error("Store connection failed: {0}")]
    Connection(String),

    /// The store did not answer in time
    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),

    /// The store answered with something unexpected
    #[error("Store protocol error: {0}")]
    Protocol(String),

    /// The store is marked unavailable (simulated outage)
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Get error code for this store error
    pub fn code(&self) -> &'static str {
        match self {
            Self::Connection(_) => "E310",
            Self::Timeout(_) => "E311",
            Self::Protocol(_) => "E312",
            Self::Unavailable(_) => "E313",
        }
    }
}

/// Atomic key-value capabilities consumed by the lock protocol
///
/// Implementations must make `set_if_absent_with_ttl`,
/// `compare_and_delete` and `compare_and_expire` single atomic steps on the
/// store side. A client-side read followed by a write is not acceptable.
#[async_trait]
pub trait LockStore: Send + Sync + fmt::Debug {
    /// Create `key -> value` with expiry `ttl` iff `key` does not exist.
    ///
    /// Returns whether the record was created.
    async fn set_if_absent_with_ttl(&self, key: &str, value: &str, ttl: Duration)
        -> StoreResult<bool>;

    /// Delete `key` iff its current value equals `expected`.
    ///
    /// Returns true when a record was deleted.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool>;

    /// Reset the expiry of `key` to `ttl` iff its current value equals `expected`.
    async fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration)
        -> StoreResult<bool>;

    /// Read the current value of `key`
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Delete `key` unconditionally
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Reset the expiry of `key` unconditionally
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_codes() {
        assert_eq!(StoreError::Connection("refused".into()).code(), "E310");
        assert_eq!(StoreError::Timeout(Duration::from_millis(5)).code(), "E311");
        assert_eq!(StoreError::Protocol("bad reply".into()).code(), "E312");
        assert_eq!(StoreError::Unavailable("down".into()).code(), "E313");
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::Timeout(Duration::from_millis(250));
        assert_eq!(err.to_string(), "Store call timed out after 250ms");
    }
}
