//! Polling acquisition loops
//!
//! The store offers no release notifications, so waiting for a lock means
//! calling `try_acquire` on a fixed cadence. Store failures count as "not
//! acquired" and are retried like contention unless a consecutive-failure
//! limit is configured.

use super::primitive::LockPrimitive;
use super::types::{AcquireOutcome, LockError, LockKey, LockResult, OwnershipToken};
use rand::Rng;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

/// Default pause between acquisition attempts
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How the acquisition loop paces itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollPolicy {
    /// Pause between attempts
    pub interval: Duration,

    /// Upper bound of random extra delay added to each pause
    pub jitter: Duration,

    /// Give up after this many consecutive store failures (None = never)
    pub max_consecutive_store_errors: Option<u32>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            jitter: Duration::ZERO,
            max_consecutive_store_errors: None,
        }
    }
}

impl PollPolicy {
    /// Set the poll interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the maximum jitter added to each pause
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Stop retrying after `limit` consecutive store failures
    pub fn with_store_error_limit(mut self, limit: u32) -> Self {
        self.max_consecutive_store_errors = Some(limit);
        self
    }

    /// Pause before the next attempt
    pub fn next_delay(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.interval;
        }
        let max_jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let extra = rand::thread_rng().gen_range(0..=max_jitter_ms);
        self.interval + Duration::from_millis(extra)
    }

    /// Longest single pause this policy can produce
    pub fn max_delay(&self) -> Duration {
        self.interval + self.jitter
    }
}

/// Summary of a successful acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acquisition {
    /// Number of `try_acquire` calls, including the successful one
    pub attempts: u32,

    /// Time spent waiting since the first attempt
    pub waited: Duration,

    /// Attempts that failed because the store was unavailable
    pub store_errors: u32,
}

/// Polls until the lock is acquired or the loop gives up
#[derive(Debug, Clone)]
pub struct AcquisitionLoop {
    primitive: LockPrimitive,
    policy: PollPolicy,
}

impl AcquisitionLoop {
    /// Create a loop over `primitive` with `policy`
    pub fn new(primitive: LockPrimitive, policy: PollPolicy) -> Self {
        Self { primitive, policy }
    }

    /// Get the polling policy
    pub fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    /// Get the lock primitive
    pub fn primitive(&self) -> &LockPrimitive {
        &self.primitive
    }

    /// Poll until acquired, with no upper bound on the wait
    pub async fn acquire_unbounded(
        &self,
        key: &LockKey,
        token: &OwnershipToken,
        lease: Duration,
    ) -> LockResult<Acquisition> {
        self.run(key, token, lease, None).await
    }

    /// Poll until acquired or until `wait_timeout` has elapsed
    ///
    /// The last pause is shortened to land on the deadline and each attempt
    /// is cut off once the deadline has passed, so the loop overshoots by at
    /// most one poll interval even when the store hangs.
    pub async fn acquire_bounded(
        &self,
        key: &LockKey,
        token: &OwnershipToken,
        lease: Duration,
        wait_timeout: Duration,
    ) -> LockResult<Acquisition> {
        self.run(key, token, lease, Some(wait_timeout)).await
    }

    async fn run(
        &self,
        key: &LockKey,
        token: &OwnershipToken,
        lease: Duration,
        wait_timeout: Option<Duration>,
    ) -> LockResult<Acquisition> {
        debug!(
            lock_key = %key,
            lease_ms = lease.as_millis(),
            wait_timeout = ?wait_timeout,
            "Attempting to acquire lock"
        );

        let start = Instant::now();
        let mut attempts = 0u32;
        let mut store_errors = 0u32;
        let mut consecutive_store_errors = 0u32;

        loop {
            attempts = attempts.saturating_add(1);

            let outcome = match wait_timeout {
                Some(limit) => {
                    // A hung store call may not hold the caller past the deadline
                    // by more than one poll interval.
                    let cap = limit
                        .saturating_sub(start.elapsed())
                        .max(self.policy.interval);
                    timeout(cap, self.primitive.try_acquire(key, token, lease))
                        .await
                        .ok()
                }
                None => Some(self.primitive.try_acquire(key, token, lease).await),
            };

            match outcome {
                Some(AcquireOutcome::Acquired) => {
                    let waited = start.elapsed();
                    info!(
                        lock_key = %key,
                        attempts,
                        elapsed_ms = waited.as_millis(),
                        "Lock acquired"
                    );
                    return Ok(Acquisition {
                        attempts,
                        waited,
                        store_errors,
                    });
                }
                Some(AcquireOutcome::NotAcquired) => {
                    consecutive_store_errors = 0;
                }
                Some(AcquireOutcome::StoreUnavailable(source)) => {
                    store_errors = store_errors.saturating_add(1);
                    consecutive_store_errors = consecutive_store_errors.saturating_add(1);

                    if let Some(limit) = self.policy.max_consecutive_store_errors {
                        if consecutive_store_errors >= limit {
                            warn!(
                                lock_key = %key,
                                failures = consecutive_store_errors,
                                "Giving up on lock: store keeps failing"
                            );
                            return Err(LockError::StoreUnavailable {
                                key: key.to_string(),
                                failures: consecutive_store_errors,
                                source,
                            });
                        }
                    }
                }
                None => {
                    warn!(lock_key = %key, attempts, "Lock attempt cut off at the deadline");
                    self.release_in_background(key, token);
                }
            }

            if let Some(limit) = wait_timeout {
                let waited = start.elapsed();
                if waited >= limit {
                    warn!(
                        lock_key = %key,
                        attempts,
                        waited_ms = waited.as_millis(),
                        timeout_ms = limit.as_millis(),
                        "Lock acquisition timed out"
                    );
                    return Err(LockError::AcquisitionTimedOut {
                        key: key.to_string(),
                        waited,
                    });
                }
            }

            let delay = match wait_timeout {
                Some(limit) => self
                    .policy
                    .next_delay()
                    .min(limit.saturating_sub(start.elapsed())),
                None => self.policy.next_delay(),
            };
            sleep(delay).await;
        }
    }

    /// Clear a record that a cut-off attempt may still have created
    fn release_in_background(&self, key: &LockKey, token: &OwnershipToken) {
        let primitive = self.primitive.clone();
        let key = key.clone();
        let token = token.clone();
        tokio::spawn(async move {
            primitive.release(&key, &token).await;
        });
    }
}
