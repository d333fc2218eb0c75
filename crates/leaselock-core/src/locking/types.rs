//! Lock types and error definitions

use crate::store::StoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Longest accepted lock key, in bytes
pub const MAX_KEY_LEN: usize = 512;

/// Result type for lock operations
pub type LockResult<T> = std::result::Result<T, LockError>;

/// Lock errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// Bounded wait ran out before the lock was acquired
    #[error("Lock timeout: resource '{key}' still held after waiting {waited:?}")]
    AcquisitionTimedOut {
        key: String,
        waited: Duration,
    },

    /// The store kept failing and the acquisition loop gave up
    #[error("Lock store unavailable for '{key}' after {failures} consecutive failures: {source}")]
    StoreUnavailable {
        key: String,
        failures: u32,
        #[source]
        source: StoreError,
    },

    /// The key cannot be used as a lock key
    #[error("Invalid lock key '{key}': {reason}")]
    InvalidKey {
        key: String,
        reason: String,
    },

    /// The lease cannot be stored as a TTL
    #[error("Invalid lease {0:?}: leases must be between one millisecond and one year")]
    InvalidLease(Duration),
}

impl LockError {
    /// Get error code for this lock error
    pub fn code(&self) -> &'static str {
        match self {
            Self::AcquisitionTimedOut { .. } => "E300",
            Self::StoreUnavailable { .. } => "E301",
            Self::InvalidKey { .. } => "E302",
            Self::InvalidLease(_) => "E303",
        }
    }

    /// Whether this is a bounded-wait timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::AcquisitionTimedOut { .. })
    }
}

/// Name of a protected resource, shared by every competing process
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LockKey(String);

impl LockKey {
    /// Validate and wrap a key
    ///
    /// Keys must be non-empty, at most [`MAX_KEY_LEN`] bytes, and free of
    /// whitespace and control characters.
    pub fn new(key: impl Into<String>) -> LockResult<Self> {
        let key = key.into();
        let invalid = |reason: &str| LockError::InvalidKey {
            key: key.clone(),
            reason: reason.to_string(),
        };

        if key.is_empty() {
            return Err(invalid("key is empty"));
        }
        if key.len() > MAX_KEY_LEN {
            return Err(invalid(&format!("key is longer than {} bytes", MAX_KEY_LEN)));
        }
        if key.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(invalid("key contains whitespace or control characters"));
        }

        Ok(Self(key))
    }

    /// Build a key under a namespace prefix (`prefix` may be empty)
    pub fn with_prefix(prefix: &str, name: &str) -> LockResult<Self> {
        Self::new(format!("{}{}", prefix, name))
    }

    /// Get the key as stored
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for LockKey {
    type Error = LockError;

    fn try_from(value: String) -> LockResult<Self> {
        Self::new(value)
    }
}

impl From<LockKey> for String {
    fn from(key: LockKey) -> Self {
        key.0
    }
}

/// Credential proving the right to release one specific lock record
///
/// A fresh random token is generated for every acquisition attempt.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnershipToken(String);

impl OwnershipToken {
    /// Generate a fresh random token
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wrap a token received from elsewhere (e.g. the CLI `release` command)
    pub fn from_existing(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Get the token as stored
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for OwnershipToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OwnershipToken({})", self.0)
    }
}

impl fmt::Display for OwnershipToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of a single acquisition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The record was created; the caller holds the lock
    Acquired,
    /// Another holder owns the record
    NotAcquired,
    /// The store call failed; the lock is treated as not acquired
    StoreUnavailable(StoreError),
}

impl AcquireOutcome {
    /// Whether the lock is now held
    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired)
    }
}

/// Result of a release attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The record held our token and was deleted
    Released,
    /// The record is gone or belongs to someone else; nothing was deleted
    Mismatch,
    /// The store call failed; the record may still exist until its TTL
    StoreUnavailable(StoreError),
}

impl ReleaseOutcome {
    /// Whether our record was deleted
    pub fn is_released(&self) -> bool {
        matches!(self, Self::Released)
    }
}

impl fmt::Display for ReleaseOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Released => write!(f, "released"),
            Self::Mismatch => write!(f, "mismatch"),
            Self::StoreUnavailable(_) => write!(f, "store_unavailable"),
        }
    }
}

/// Lock status as seen by a particular caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStatus {
    /// No record exists
    Available,
    /// The record holds the caller's token
    HeldBySelf,
    /// The record holds another token
    HeldByOther,
}

impl fmt::Display for LockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Available => write!(f, "available"),
            Self::HeldBySelf => write!(f, "held_by_self"),
            Self::HeldByOther => write!(f, "held_by_other"),
        }
    }
}

/// Lifecycle of one acquisition attempt
///
/// `Idle -> Acquiring -> {Held -> Releasing -> Idle} | {TimedOut -> Idle} | {StoreError -> Idle}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    Idle,
    Acquiring,
    Held,
    Releasing,
    TimedOut,
    StoreError,
}

impl LockState {
    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(self, next: LockState) -> bool {
        use LockState::*;
        matches!(
            (self, next),
            (Idle, Acquiring)
                | (Acquiring, Held)
                | (Acquiring, TimedOut)
                | (Acquiring, StoreError)
                | (Held, Releasing)
                | (Releasing, Idle)
                | (TimedOut, Idle)
                | (StoreError, Idle)
        )
    }

    /// Move to `next`, asserting the transition in debug builds
    pub fn advance(self, next: LockState) -> LockState {
        debug_assert!(
            self.can_transition_to(next),
            "illegal lock state transition {} -> {}",
            self,
            next
        );
        next
    }

    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Acquiring => "acquiring",
            Self::Held => "held",
            Self::Releasing => "releasing",
            Self::TimedOut => "timed_out",
            Self::StoreError => "store_error",
        }
    }
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Longest lease accepted for a lock record
pub const MAX_LEASE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Reject leases that cannot be stored as a millisecond TTL
pub fn validate_lease(lease: Duration) -> LockResult<()> {
    if lease < Duration::from_millis(1) || lease > MAX_LEASE {
        Err(LockError::InvalidLease(lease))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_key_validation() {
        assert!(LockKey::new("order-42").is_ok());
        assert!(LockKey::new("jobs:nightly/export").is_ok());

        let err = LockKey::new("").unwrap_err();
        assert_eq!(err.code(), "E302");
        assert!(LockKey::new("has space").is_err());
        assert!(LockKey::new("tab\there").is_err());
        assert!(LockKey::new("x".repeat(MAX_KEY_LEN)).is_ok());
        assert!(LockKey::new("x".repeat(MAX_KEY_LEN + 1)).is_err());
    }

    #[test]
    fn test_lock_key_prefix() {
        let key = LockKey::with_prefix("lock:", "order-42").unwrap();
        assert_eq!(key.as_str(), "lock:order-42");

        let bare = LockKey::with_prefix("", "order-42").unwrap();
        assert_eq!(bare.to_string(), "order-42");
    }

    #[test]
    fn test_tokens_are_fresh() {
        let a = OwnershipToken::generate();
        let b = OwnershipToken::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
        assert!(Uuid::parse_str(a.as_str()).is_ok());
    }

    #[test]
    fn test_state_machine_transitions() {
        use LockState::*;

        let held_path = [Idle, Acquiring, Held, Releasing, Idle];
        for pair in held_path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }

        assert!(Acquiring.can_transition_to(TimedOut));
        assert!(TimedOut.can_transition_to(Idle));
        assert!(Acquiring.can_transition_to(StoreError));

        assert!(!Idle.can_transition_to(Held));
        assert!(!Held.can_transition_to(Idle));
        assert!(!TimedOut.can_transition_to(Releasing));
    }

    #[test]
    fn test_lock_error_codes() {
        let timeout = LockError::AcquisitionTimedOut {
            key: "k".to_string(),
            waited: Duration::from_secs(1),
        };
        assert_eq!(timeout.code(), "E300");
        assert!(timeout.is_timeout());

        let store = LockError::StoreUnavailable {
            key: "k".to_string(),
            failures: 3,
            source: StoreError::Unavailable("down".to_string()),
        };
        assert_eq!(store.code(), "E301");
        assert!(!store.is_timeout());

        assert_eq!(LockError::InvalidLease(Duration::ZERO).code(), "E303");
    }

    #[test]
    fn test_validate_lease() {
        assert!(validate_lease(Duration::from_millis(1)).is_ok());
        assert!(validate_lease(Duration::from_secs(5)).is_ok());
        assert_eq!(
            validate_lease(Duration::from_micros(999)),
            Err(LockError::InvalidLease(Duration::from_micros(999)))
        );
    }

    #[test]
    fn test_validate_lease_upper_bound() {
        assert!(validate_lease(MAX_LEASE).is_ok());
        assert_eq!(
            validate_lease(MAX_LEASE + Duration::from_millis(1)),
            Err(LockError::InvalidLease(MAX_LEASE + Duration::from_millis(1)))
        );
        assert_eq!(validate_lease(Duration::MAX), Err(LockError::InvalidLease(Duration::MAX)));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(LockStatus::Available.to_string(), "available");
        assert_eq!(LockStatus::HeldBySelf.to_string(), "held_by_self");
        assert_eq!(LockStatus::HeldByOther.to_string(), "held_by_other");
        assert_eq!(ReleaseOutcome::Mismatch.to_string(), "mismatch");
    }
}
