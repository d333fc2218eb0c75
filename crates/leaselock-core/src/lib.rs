//! Leaselock Core Library
//!
//! This crate provides lease-based distributed locks on top of a shared
//! key-value store, including:
//! - Store adapters (Redis, in-memory)
//! - The lock protocol (atomic set-if-absent, atomic compare-and-delete)
//! - Polling acquisition with optional deadlines
//! - Critical-section runners that always release
//! - Configuration file management

pub mod config;
pub mod error;
pub mod locking;
pub mod store;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Config, LockConfig};
    pub use crate::error::{Error, Result};
    pub use crate::locking::{CriticalSectionError, LeaseGuard, LockClient, LockError};
    pub use crate::store::{LockStore, MemoryStore, RedisStore};
}
