//! Lease-based distributed locking
//!
//! Mutual exclusion between independent processes, arbitrated entirely by
//! a shared key-value store. A lock is a store record `key -> token` with a
//! TTL; it is created with an atomic set-if-absent and removed with an
//! atomic compare-and-delete, so a holder can never delete a record that a
//! newer holder created after its own lease lapsed.
//!
//! # Architecture
//!
//! - **Primitive**: `LockPrimitive` issues single `try_acquire` / `release` calls
//! - **Acquisition loop**: `AcquisitionLoop` polls until acquired or timed out
//! - **Runner**: `LockClient` runs work under the lock and always releases it
//! - **Guards**: `LeaseGuard` for callers managing the lock themselves
//!
//! # Caveats
//!
//! There are no fencing tokens. If work outlives its lease, the store will
//! hand the lock to another waiter while the work is still running. Pick a
//! lease longer than the critical section, or extend it from the guard.
//!
//! # Example
//!
//! ```ignore
//! use leaselock_core::locking::LockClient;
//! use leaselock_core::store::RedisStore;
//!
//! let store = RedisStore::connect("redis://127.0.0.1/", Duration::from_secs(2)).await?;
//! let client = LockClient::with_defaults(Arc::new(store));
//!
//! let total = client
//!     .run_exclusive_or_timeout("order-42", Duration::from_secs(5), Duration::from_secs(2), || async {
//!         settle_order(42).await
//!     })
//!     .await?;
//! ```

pub mod acquire;
pub mod guard;
pub mod primitive;
pub mod runner;
pub mod types;

// Re-export main types
pub use acquire::{Acquisition, AcquisitionLoop, PollPolicy, DEFAULT_POLL_INTERVAL};
pub use guard::LeaseGuard;
pub use primitive::LockPrimitive;
pub use runner::{CriticalSectionError, LockClient};
pub use types::{
    AcquireOutcome, LockError, LockKey, LockResult, LockState, LockStatus, OwnershipToken,
    ReleaseOutcome, MAX_LEASE,
};
