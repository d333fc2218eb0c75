//! In-process lock store
//!
//! Keeps records in a map guarded by a mutex. Expiry is measured with
//! `tokio::time::Instant`, so tests running on a paused clock can move
//! time forward and watch leases lapse. Expired records are treated as
//! absent and purged lazily on access.

use super::{LockStore, StoreError, StoreResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Record {
    value: String,
    expires_at: Option<Instant>,
}

impl Record {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|exp| now >= exp)
    }
}

/// In-memory [`LockStore`] shared by every clone
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: Arc<Mutex<HashMap<String, Record>>>,
    unavailable: Arc<AtomicBool>,
    latency_ms: Arc<AtomicU64>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage (`false`) or recovery (`true`)
    ///
    /// While unavailable every call fails with [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Delay every call by `latency` before it touches the records
    pub fn set_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(ms, Ordering::SeqCst);
    }

    /// Whether the store currently accepts calls
    pub fn is_available(&self) -> bool {
        !self.unavailable.load(Ordering::SeqCst)
    }

    /// Remaining time to live of `key`, if it exists and has an expiry
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let mut records = self.lock_records();
        live_record(&mut records, key, now)
            .and_then(|r| r.expires_at)
            .map(|exp| exp.saturating_duration_since(now))
    }

    /// Number of live records
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let mut records = self.lock_records();
        records.retain(|_, r| !r.is_expired(now));
        records.len()
    }

    /// Whether there are no live records
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn simulate_latency(&self) {
        let ms = self.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store is offline".to_string()))
        }
    }

    fn lock_records(&self) -> MutexGuard<'_, HashMap<String, Record>> {
        // A panic while holding the map cannot leave a record half-written.
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Expiry instant for `ttl` from `now`; a TTL past the clock's range never expires
fn expiry(now: Instant, ttl: Duration) -> Option<Instant> {
    now.checked_add(ttl)
}

/// Look up `key`, dropping it first if it has expired
fn live_record<'a>(
    records: &'a mut HashMap<String, Record>,
    key: &str,
    now: Instant,
) -> Option<&'a mut Record> {
    if records.get(key).is_some_and(|r| r.is_expired(now)) {
        records.remove(key);
    }
    records.get_mut(key)
}

#[async_trait]
impl LockStore for MemoryStore {
    async fn set_if_absent_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        self.simulate_latency().await;
        self.check_available()?;
        let now = Instant::now();
        let mut records = self.lock_records();

        if live_record(&mut records, key, now).is_some() {
            return Ok(false);
        }

        records.insert(
            key.to_string(),
            Record {
                value: value.to_string(),
                expires_at: expiry(now, ttl),
            },
        );
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool> {
        self.simulate_latency().await;
        self.check_available()?;
        let now = Instant::now();
        let mut records = self.lock_records();

        let owned = live_record(&mut records, key, now).is_some_and(|r| r.value == expected);
        if owned {
            records.remove(key);
        }
        Ok(owned)
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        self.simulate_latency().await;
        self.check_available()?;
        let now = Instant::now();
        let mut records = self.lock_records();

        match live_record(&mut records, key, now) {
            Some(record) if record.value == expected => {
                record.expires_at = expiry(now, ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.simulate_latency().await;
        self.check_available()?;
        let now = Instant::now();
        let mut records = self.lock_records();
        Ok(live_record(&mut records, key, now).map(|r| r.value.clone()))
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.simulate_latency().await;
        self.check_available()?;
        let now = Instant::now();
        let mut records = self.lock_records();
        if live_record(&mut records, key, now).is_some() {
            records.remove(key);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.simulate_latency().await;
        self.check_available()?;
        let now = Instant::now();
        let mut records = self.lock_records();
        match live_record(&mut records, key, now) {
            Some(record) => {
                record.expires_at = expiry(now, ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
