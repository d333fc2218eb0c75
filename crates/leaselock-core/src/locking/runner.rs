//! Critical-section runner
//!
//! [`LockClient`] ties the pieces together: it mints a fresh ownership
//! token, waits for the lock, runs the caller's work and releases the lock
//! on every exit path, including when the work returns an error or panics.

use super::acquire::{Acquisition, AcquisitionLoop};
use super::guard::LeaseGuard;
use super::primitive::LockPrimitive;
use super::types::{
    validate_lease, AcquireOutcome, LockError, LockKey, LockResult, LockState, OwnershipToken,
    ReleaseOutcome,
};
use crate::config::{Config, LockConfig};
use crate::store::{LockStore, RedisStore};
use futures_util::FutureExt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, trace};

/// Why a critical section produced no result
#[derive(Error, Debug)]
pub enum CriticalSectionError<E> {
    /// The lock was never held; the work did not run
    #[error(transparent)]
    Lock(#[from] LockError),

    /// The work ran under the lock and failed; the lock has been released
    #[error("Critical section failed: {0}")]
    Work(E),
}

impl<E> CriticalSectionError<E> {
    /// Whether the bounded wait ran out before the lock was acquired
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Lock(e) if e.is_timeout())
    }

    /// The work's own error, if the work ran and failed
    pub fn into_work_error(self) -> Option<E> {
        match self {
            Self::Work(e) => Some(e),
            Self::Lock(_) => None,
        }
    }
}

/// Distributed lock client
///
/// Cheap to clone; clones share the store connection.
#[derive(Debug, Clone)]
pub struct LockClient {
    acquirer: AcquisitionLoop,
    config: LockConfig,
}

impl LockClient {
    /// Create a client over `store` with `config`
    pub fn new(store: Arc<dyn LockStore>, config: LockConfig) -> Self {
        let acquirer = AcquisitionLoop::new(LockPrimitive::new(store), config.poll_policy());
        Self { acquirer, config }
    }

    /// Create a client with default configuration
    pub fn with_defaults(store: Arc<dyn LockStore>) -> Self {
        Self::new(store, LockConfig::default())
    }

    /// Connect to the Redis store named in `config`
    pub async fn connect(config: &Config) -> crate::Result<Self> {
        let store = RedisStore::connect(&config.store.url, config.store.response_timeout()).await?;
        Ok(Self::new(Arc::new(store), config.lock_config()))
    }

    /// Get the configuration
    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Get the single-shot lock primitive
    pub fn primitive(&self) -> &LockPrimitive {
        self.acquirer.primitive()
    }

    /// Build a lock key under the configured prefix
    pub fn key(&self, name: &str) -> LockResult<LockKey> {
        LockKey::with_prefix(&self.config.key_prefix, name)
    }

    // ========== Critical sections ==========

    /// Run `work` while holding `name`, waiting as long as it takes
    ///
    /// Use `T = ()` for work that produces no value. The lock is released
    /// after `work` finishes, fails, or panics; a panic resumes once the
    /// release has been attempted.
    pub async fn run_exclusive<T, E, F, Fut>(
        &self,
        name: &str,
        lease: Duration,
        work: F,
    ) -> Result<T, CriticalSectionError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(name, lease, None, work).await
    }

    /// Run `work` while holding `name`, waiting at most `wait_timeout`
    ///
    /// On timeout `work` is never called and the error satisfies
    /// [`CriticalSectionError::is_timeout`].
    pub async fn run_exclusive_or_timeout<T, E, F, Fut>(
        &self,
        name: &str,
        lease: Duration,
        wait_timeout: Duration,
        work: F,
    ) -> Result<T, CriticalSectionError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(name, lease, Some(wait_timeout), work).await
    }

    /// [`run_exclusive`](Self::run_exclusive) with the configured default lease
    pub async fn run_exclusive_default<T, E, F, Fut>(
        &self,
        name: &str,
        work: F,
    ) -> Result<T, CriticalSectionError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(name, self.config.default_lease, None, work).await
    }

    /// [`run_exclusive_or_timeout`](Self::run_exclusive_or_timeout) with the
    /// configured default lease and wait
    pub async fn run_exclusive_or_timeout_default<T, E, F, Fut>(
        &self,
        name: &str,
        work: F,
    ) -> Result<T, CriticalSectionError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let wait = self.config.default_wait;
        self.run(name, self.config.default_lease, Some(wait), work).await
    }

    async fn run<T, E, F, Fut>(
        &self,
        name: &str,
        lease: Duration,
        wait_timeout: Option<Duration>,
        work: F,
    ) -> Result<T, CriticalSectionError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let key = self.key(name)?;
        validate_lease(lease)?;
        let token = OwnershipToken::generate();

        let mut state = LockState::Idle.advance(LockState::Acquiring);
        trace!(lock_key = %key, %state, "Critical section starting");

        let acquired = match wait_timeout {
            Some(wait) => self.acquirer.acquire_bounded(&key, &token, lease, wait).await,
            None => self.acquirer.acquire_unbounded(&key, &token, lease).await,
        };

        let acquisition = match acquired {
            Ok(acquisition) => acquisition,
            Err(e) => {
                state = state.advance(match e {
                    LockError::AcquisitionTimedOut { .. } => LockState::TimedOut,
                    _ => LockState::StoreError,
                });
                trace!(lock_key = %key, %state, "Critical section abandoned");

                // Normally a no-op: the fresh token only reaches the store when an
                // attempt was cut off by the deadline mid-call.
                let outcome = self.acquirer.primitive().release(&key, &token).await;
                debug!(lock_key = %key, %outcome, "Release after failed acquisition");

                state.advance(LockState::Idle);
                return Err(CriticalSectionError::Lock(e));
            }
        };

        state = state.advance(LockState::Held);
        trace!(lock_key = %key, %state, "Running critical section");

        // If this future is dropped mid-work, the guard's Drop releases the lock.
        let guard = self.guard(key.clone(), token, lease, acquisition);
        let result = AssertUnwindSafe(async move { work().await })
            .catch_unwind()
            .await;

        state = state.advance(LockState::Releasing);
        trace!(lock_key = %key, %state, "Critical section finished");
        guard.release().await;
        state.advance(LockState::Idle);

        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                error!(lock_key = %key, "Critical section work failed");
                Err(CriticalSectionError::Work(e))
            }
            Err(payload) => {
                error!(lock_key = %key, "Critical section work panicked");
                panic::resume_unwind(payload)
            }
        }
    }

    // ========== Guards ==========

    /// Acquire `name`, waiting as long as it takes
    pub async fn acquire(&self, name: &str, lease: Duration) -> LockResult<LeaseGuard> {
        self.acquire_guard(name, lease, None).await
    }

    /// Acquire `name`, waiting at most `wait_timeout`
    pub async fn acquire_timeout(
        &self,
        name: &str,
        lease: Duration,
        wait_timeout: Duration,
    ) -> LockResult<LeaseGuard> {
        self.acquire_guard(name, lease, Some(wait_timeout)).await
    }

    /// Make a single attempt to acquire `name`
    ///
    /// Returns `Ok(None)` when the lock is held elsewhere or the store is
    /// unavailable (fail-closed).
    pub async fn try_lock(&self, name: &str, lease: Duration) -> LockResult<Option<LeaseGuard>> {
        let key = self.key(name)?;
        validate_lease(lease)?;
        let token = OwnershipToken::generate();

        let outcome = self.acquirer.primitive().try_acquire(&key, &token, lease).await;
        let guard = match outcome {
            AcquireOutcome::Acquired => {
                let acquisition = Acquisition {
                    attempts: 1,
                    waited: Duration::ZERO,
                    store_errors: 0,
                };
                Some(self.guard(key, token, lease, acquisition))
            }
            AcquireOutcome::NotAcquired | AcquireOutcome::StoreUnavailable(_) => None,
        };
        Ok(guard)
    }

    /// Release a lock acquired elsewhere, e.g. by a detached guard
    pub async fn release(&self, name: &str, token: &OwnershipToken) -> LockResult<ReleaseOutcome> {
        let key = self.key(name)?;
        Ok(self.acquirer.primitive().release(&key, token).await)
    }

    async fn acquire_guard(
        &self,
        name: &str,
        lease: Duration,
        wait_timeout: Option<Duration>,
    ) -> LockResult<LeaseGuard> {
        let key = self.key(name)?;
        validate_lease(lease)?;
        let token = OwnershipToken::generate();

        let acquisition = match wait_timeout {
            Some(wait) => self.acquirer.acquire_bounded(&key, &token, lease, wait).await?,
            None => self.acquirer.acquire_unbounded(&key, &token, lease).await?,
        };
        Ok(self.guard(key, token, lease, acquisition))
    }

    fn guard(
        &self,
        key: LockKey,
        token: OwnershipToken,
        lease: Duration,
        acquisition: Acquisition,
    ) -> LeaseGuard {
        LeaseGuard::new(self.acquirer.primitive().clone(), key, token, lease, acquisition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn create_test_client() -> (LockClient, MemoryStore) {
        let store = MemoryStore::new();
        (LockClient::with_defaults(Arc::new(store.clone())), store)
    }

    #[tokio::test]
    async fn test_run_exclusive_returns_value_and_releases() {
        let (client, store) = create_test_client();

        let value = client
            .run_exclusive("job", Duration::from_secs(5), || async { Ok::<_, Infallible>(42) })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_void_work() {
        let (client, store) = create_test_client();
        let ran = &AtomicBool::new(false);

        client
            .run_exclusive("void", Duration::from_secs(5), || async move {
                ran.store(true, Ordering::SeqCst);
                Ok::<(), Infallible>(())
            })
            .await
            .unwrap();

        assert!(ran.load(Ordering::SeqCst));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_work_error_propagates_after_release() {
        let (client, store) = create_test_client();

        let err = client
            .run_exclusive("failing", Duration::from_secs(5), || async {
                Err::<(), _>("disk full")
            })
            .await
            .unwrap_err();

        assert!(!err.is_timeout());
        assert_eq!(err.into_work_error(), Some("disk full"));
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_runner_releases_lock() {
        let (client, store) = create_test_client();

        let cancelled = tokio::time::timeout(
            Duration::from_millis(50),
            client.run_exclusive("abandoned", Duration::from_secs(60), || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<(), Infallible>(())
            }),
        )
        .await;
        assert!(cancelled.is_err());

        // The release runs on a spawned task
        for _ in 0..10 {
            if store.is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_lease_rejected() {
        let (client, store) = create_test_client();

        let err = client
            .run_exclusive("forever", Duration::MAX, || async { Ok::<_, Infallible>(()) })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            CriticalSectionError::Lock(LockError::InvalidLease(Duration::MAX))
        ));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_key_fails_before_store() {
        let (client, store) = create_test_client();
        store.set_available(false);

        let err = client
            .run_exclusive("bad key", Duration::from_secs(5), || async { Ok::<_, Infallible>(()) })
            .await
            .unwrap_err();

        assert!(matches!(err, CriticalSectionError::Lock(LockError::InvalidKey { .. })));
    }

    #[tokio::test]
    async fn test_zero_lease_rejected() {
        let (client, _store) = create_test_client();

        let err = client.acquire("job", Duration::ZERO).await.unwrap_err();
        assert_eq!(err, LockError::InvalidLease(Duration::ZERO));
    }

    #[tokio::test]
    async fn test_key_prefix_applied() {
        let store = MemoryStore::new();
        let config = LockConfig::default().with_key_prefix("lock:");
        let client = LockClient::new(Arc::new(store.clone()), config);

        let guard = client.acquire("order-42", Duration::from_secs(5)).await.unwrap();
        assert_eq!(guard.key().as_str(), "lock:order-42");
        assert!(store.get("lock:order-42").await.unwrap().is_some());
        guard.release().await;
    }

    #[tokio::test]
    async fn test_try_lock_is_single_shot() {
        let (client, _store) = create_test_client();

        let held = client.try_lock("single", Duration::from_secs(5)).await.unwrap();
        assert!(held.is_some());
        assert!(client.try_lock("single", Duration::from_secs(5)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_release_detached_token() {
        let (client, store) = create_test_client();

        let guard = client.acquire("detached", Duration::from_secs(5)).await.unwrap();
        let (_, token) = guard.detach();
        assert!(!store.is_empty());

        let outcome = client.release("detached", &token).await.unwrap();
        assert_eq!(outcome, ReleaseOutcome::Released);
        assert!(store.is_empty());
    }
}
