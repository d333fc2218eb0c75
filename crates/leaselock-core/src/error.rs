//! Error types for Leaselock

use crate::locking::LockError;
use crate::store::StoreError;
use thiserror::Error;

/// Result type alias using Leaselock's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Leaselock error types with helpful messages and suggestions
#[derive(Error, Debug)]
pub enum Error {
    // Lock errors (E300-E309)
    #[error(transparent)]
    Lock(#[from] LockError),

    // Store errors (E310-E319)
    #[error(transparent)]
    Store(#[from] StoreError),

    // Config errors (E600-E699)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Input errors (E800-E899)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::Lock(e) => e.code(),
            Self::Store(e) => e.code(),
            Self::ConfigError(_) => "E600",
            Self::InvalidInput(_) => "E800",
            Self::Io(_) => "E9999",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::Lock(LockError::AcquisitionTimedOut { key, .. }) => Some(format!(
                "leaselock status {} (or retry with a longer --wait)",
                key
            )),
            Self::Lock(LockError::StoreUnavailable { .. }) | Self::Store(_) => {
                Some("Check the store with `leaselock config get store.url`".to_string())
            }
            Self::ConfigError(_) => Some("leaselock config show".to_string()),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::ConfigError(format!("{:#}", err))
    }
}
