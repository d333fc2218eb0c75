//! Single-shot lock operations
//!
//! `try_acquire` and `release` each issue exactly one atomic store call.
//! Neither retries; retry policy lives in the acquisition loop.

use super::types::{AcquireOutcome, LockKey, LockStatus, OwnershipToken, ReleaseOutcome};
use crate::store::{LockStore, StoreResult};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// Lock primitive over a shared [`LockStore`]
#[derive(Debug, Clone)]
pub struct LockPrimitive {
    store: Arc<dyn LockStore>,
}

impl LockPrimitive {
    /// Create a primitive over `store`
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self { store }
    }

    /// Get the underlying store
    pub fn store(&self) -> &Arc<dyn LockStore> {
        &self.store
    }

    /// Attempt once to create the lock record `key -> token` with TTL `lease`
    ///
    /// Store failures are reported as [`AcquireOutcome::StoreUnavailable`]
    /// and must be treated as "not acquired".
    pub async fn try_acquire(
        &self,
        key: &LockKey,
        token: &OwnershipToken,
        lease: Duration,
    ) -> AcquireOutcome {
        match self
            .store
            .set_if_absent_with_ttl(key.as_str(), token.as_str(), lease)
            .await
        {
            Ok(true) => {
                debug!(lock_key = %key, lease_ms = lease.as_millis(), "Lock record created");
                AcquireOutcome::Acquired
            }
            Ok(false) => {
                trace!(lock_key = %key, "Lock held by another owner");
                AcquireOutcome::NotAcquired
            }
            Err(e) => {
                warn!(
                    lock_key = %key,
                    lease_ms = lease.as_millis(),
                    error = %e,
                    "Lock acquisition failed; treating as not acquired"
                );
                AcquireOutcome::StoreUnavailable(e)
            }
        }
    }

    /// Delete the lock record iff it still holds `token`
    ///
    /// Never retried: a second delete could remove a newer holder's record.
    pub async fn release(&self, key: &LockKey, token: &OwnershipToken) -> ReleaseOutcome {
        match self.store.compare_and_delete(key.as_str(), token.as_str()).await {
            Ok(true) => {
                debug!(lock_key = %key, "Lock released");
                ReleaseOutcome::Released
            }
            Ok(false) => {
                warn!(
                    lock_key = %key,
                    "Lock release skipped: lease expired or now owned by another holder"
                );
                ReleaseOutcome::Mismatch
            }
            Err(e) => {
                error!(lock_key = %key, error = %e, "Lock release failed; record will lapse at its TTL");
                ReleaseOutcome::StoreUnavailable(e)
            }
        }
    }

    /// Reset the TTL of the lock record iff it still holds `token`
    ///
    /// Returns false when the lease was already lost.
    pub async fn extend(
        &self,
        key: &LockKey,
        token: &OwnershipToken,
        lease: Duration,
    ) -> StoreResult<bool> {
        let extended = self
            .store
            .compare_and_expire(key.as_str(), token.as_str(), lease)
            .await?;

        if extended {
            debug!(lock_key = %key, lease_ms = lease.as_millis(), "Lock lease extended");
        } else {
            warn!(lock_key = %key, "Lock lease could not be extended: no longer the holder");
        }
        Ok(extended)
    }

    /// Check who holds `key`, relative to `token` when one is given
    pub async fn status(
        &self,
        key: &LockKey,
        token: Option<&OwnershipToken>,
    ) -> StoreResult<LockStatus> {
        let status = match self.store.get(key.as_str()).await? {
            None => LockStatus::Available,
            Some(current) if token.is_some_and(|t| t.as_str() == current) => LockStatus::HeldBySelf,
            Some(_) => LockStatus::HeldByOther,
        };
        Ok(status)
    }

    /// Token currently stored under `key`
    pub async fn holder(&self, key: &LockKey) -> StoreResult<Option<OwnershipToken>> {
        Ok(self
            .store
            .get(key.as_str())
            .await?
            .map(OwnershipToken::from_existing))
    }

    /// Delete `key` regardless of who holds it
    ///
    /// For operators clearing a lock whose holder is known to be gone.
    pub async fn force_release(&self, key: &LockKey) -> StoreResult<bool> {
        let removed = self.store.delete(key.as_str()).await?;
        warn!(lock_key = %key, removed, "Lock force-released");
        Ok(removed)
    }
}
