//! Lease guards
//!
//! A [`LeaseGuard`] represents a lock this process currently holds. Release
//! is an async store call, so it is normally awaited via
//! [`LeaseGuard::release`]. A guard dropped without being released spawns
//! the release on the current tokio runtime.

use super::acquire::Acquisition;
use super::primitive::LockPrimitive;
use super::types::{LockKey, OwnershipToken, ReleaseOutcome};
use crate::store::StoreResult;
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// A held lease on one lock key
#[derive(Debug)]
pub struct LeaseGuard {
    primitive: LockPrimitive,
    key: LockKey,
    token: OwnershipToken,
    lease: Duration,
    acquired_at: DateTime<Utc>,
    lease_started: Instant,
    acquisition: Acquisition,
    released: bool,
}

impl LeaseGuard {
    pub(crate) fn new(
        primitive: LockPrimitive,
        key: LockKey,
        token: OwnershipToken,
        lease: Duration,
        acquisition: Acquisition,
    ) -> Self {
        Self {
            primitive,
            key,
            token,
            lease,
            acquired_at: Utc::now(),
            lease_started: Instant::now(),
            acquisition,
            released: false,
        }
    }

    /// Get the lock key
    pub fn key(&self) -> &LockKey {
        &self.key
    }

    /// Get the ownership token proving this lease
    pub fn token(&self) -> &OwnershipToken {
        &self.token
    }

    /// Get the current lease duration
    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Wall-clock time the lock was acquired
    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// How the lock was acquired
    pub fn acquisition(&self) -> &Acquisition {
        &self.acquisition
    }

    /// Time left before the store expires the record, by the local clock
    ///
    /// Clock drift between this process and the store means this is an
    /// estimate; zero means the lease has most likely lapsed.
    pub fn remaining(&self) -> Duration {
        self.lease.saturating_sub(self.lease_started.elapsed())
    }

    /// Whether the lease has most likely lapsed
    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Reset the lease to `lease` from now, if this guard still holds the lock
    pub async fn extend(&mut self, lease: Duration) -> StoreResult<bool> {
        let extended = self.primitive.extend(&self.key, &self.token, lease).await?;
        if extended {
            self.lease = lease;
            self.lease_started = Instant::now();
        }
        Ok(extended)
    }

    /// Release the lock and report what the store did
    pub async fn release(mut self) -> ReleaseOutcome {
        self.released = true;
        self.primitive.release(&self.key, &self.token).await
    }

    /// Give up the guard without releasing the lock
    ///
    /// The record stays until its TTL or an explicit release with the
    /// returned token.
    pub fn detach(mut self) -> (LockKey, OwnershipToken) {
        self.released = true;
        (self.key.clone(), self.token.clone())
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let primitive = self.primitive.clone();
        let key = self.key.clone();
        let token = self.token.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(lock_key = %key, "Lease guard dropped; releasing in background");
                handle.spawn(async move {
                    primitive.release(&key, &token).await;
                });
            }
            Err(_) => {
                warn!(
                    lock_key = %key,
                    "Lease guard dropped outside a runtime; lock will lapse at its TTL"
                );
            }
        }
    }
}

impl fmt::Display for LeaseGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Lease[{}]", self.key)
    }
}
