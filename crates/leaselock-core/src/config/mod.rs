//! Configuration management with file persistence
//!
//! [`Config`] is the on-disk shape (TOML, plain integers for durations).
//! [`LockConfig`] is the runtime view handed to the lock client.

use crate::locking::{MAX_LEASE, PollPolicy};
use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the config directory
pub const CONFIG_DIR_ENV: &str = "LEASELOCK_CONFIG_DIR";

/// Environment variable overriding `store.url`
pub const REDIS_URL_ENV: &str = "LEASELOCK_REDIS_URL";

/// Every key accepted by [`Config::get`] and [`Config::set`]
pub const CONFIG_KEYS: &[&str] = &[
    "store.url",
    "store.response_timeout_ms",
    "lock.key_prefix",
    "lock.poll_interval_ms",
    "lock.poll_jitter_ms",
    "lock.default_lease_secs",
    "lock.default_wait_secs",
    "lock.max_consecutive_store_errors",
];

/// Leaselock configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub lock: LockSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub url: String,
    pub response_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    pub key_prefix: String,
    pub poll_interval_ms: u64,
    pub poll_jitter_ms: u64,
    pub default_lease_secs: u64,
    pub default_wait_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_consecutive_store_errors: Option<u32>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/".to_string(),
            response_timeout_ms: 2000,
        }
    }
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            key_prefix: String::new(),
            poll_interval_ms: 20,
            poll_jitter_ms: 0,
            default_lease_secs: 30,
            default_wait_secs: 10,
            max_consecutive_store_errors: None,
        }
    }
}

impl StoreConfig {
    /// Per-command response timeout
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// The store URL with any credentials masked, for logs and display
    pub fn redacted_url(&self) -> String {
        crate::store::redis::redacted_url(&self.url)
    }
}

impl Config {
    /// A copy safe to print, with store credentials masked
    pub fn redacted(&self) -> Self {
        let mut shown = self.clone();
        shown.store.url = self.store.redacted_url();
        shown
    }
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var(CONFIG_DIR_ENV) {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("leaselock")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from the default path, then apply env overrides
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        if let Ok(url) = env::var(REDIS_URL_ENV) {
            config.store.url = url;
        }
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `path`, or defaults if it doesn't exist
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default path
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path()?)
    }

    /// Save configuration to `path`
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        self.validate()?;

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.store.url.starts_with("redis://")
            && !self.store.url.starts_with("rediss://")
            && !self.store.url.starts_with("redis+unix://")
        {
            return Err(anyhow!(
                "store.url must be a redis://, rediss:// or redis+unix:// URL, got '{}'",
                self.store.url
            ));
        }
        if self.store.response_timeout_ms == 0 {
            return Err(anyhow!("store.response_timeout_ms must be greater than zero"));
        }
        if self.lock.poll_interval_ms == 0 {
            return Err(anyhow!("lock.poll_interval_ms must be greater than zero"));
        }
        if self.lock.default_lease_secs == 0 || self.lock.default_lease_secs > MAX_LEASE.as_secs() {
            return Err(anyhow!(
                "lock.default_lease_secs must be between 1 and {}",
                MAX_LEASE.as_secs()
            ));
        }
        if self.lock.max_consecutive_store_errors == Some(0) {
            return Err(anyhow!(
                "lock.max_consecutive_store_errors must be at least 1 (or unset to retry forever)"
            ));
        }
        if self.lock.key_prefix.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(anyhow!("lock.key_prefix must not contain whitespace"));
        }
        Ok(())
    }

    /// Runtime lock settings
    pub fn lock_config(&self) -> LockConfig {
        LockConfig {
            key_prefix: self.lock.key_prefix.clone(),
            poll_interval: Duration::from_millis(self.lock.poll_interval_ms),
            poll_jitter: Duration::from_millis(self.lock.poll_jitter_ms),
            default_lease: Duration::from_secs(self.lock.default_lease_secs),
            default_wait: Duration::from_secs(self.lock.default_wait_secs),
            max_consecutive_store_errors: self.lock.max_consecutive_store_errors,
        }
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        match key {
            "store.url" => Ok(self.store.url.clone()),
            "store.response_timeout_ms" => Ok(self.store.response_timeout_ms.to_string()),

            "lock.key_prefix" => Ok(self.lock.key_prefix.clone()),
            "lock.poll_interval_ms" => Ok(self.lock.poll_interval_ms.to_string()),
            "lock.poll_jitter_ms" => Ok(self.lock.poll_jitter_ms.to_string()),
            "lock.default_lease_secs" => Ok(self.lock.default_lease_secs.to_string()),
            "lock.default_wait_secs" => Ok(self.lock.default_wait_secs.to_string()),
            "lock.max_consecutive_store_errors" => Ok(self
                .lock
                .max_consecutive_store_errors
                .map(|n| n.to_string())
                .unwrap_or_else(|| "none".to_string())),

            _ => Err(anyhow!(
                "Unknown configuration key: {}. Use `leaselock config show` to see available keys.",
                key
            )),
        }
    }

    /// Set a configuration value by key
    ///
    /// The change is validated as a whole; on error the config is untouched.
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut updated = self.clone();

        match key {
            "store.url" => updated.store.url = value.to_string(),
            "store.response_timeout_ms" => {
                updated.store.response_timeout_ms = parse_number(key, value)?;
            }

            "lock.key_prefix" => updated.lock.key_prefix = value.to_string(),
            "lock.poll_interval_ms" => updated.lock.poll_interval_ms = parse_number(key, value)?,
            "lock.poll_jitter_ms" => updated.lock.poll_jitter_ms = parse_number(key, value)?,
            "lock.default_lease_secs" => {
                updated.lock.default_lease_secs = parse_number(key, value)?;
            }
            "lock.default_wait_secs" => updated.lock.default_wait_secs = parse_number(key, value)?,
            "lock.max_consecutive_store_errors" => {
                updated.lock.max_consecutive_store_errors = match value {
                    "" | "none" => None,
                    n => Some(parse_number(key, n)?),
                };
            }

            _ => {
                return Err(anyhow!(
                    "Unknown configuration key: {}. Use `leaselock config show` to see available keys.",
                    key
                ));
            }
        }

        updated.validate()?;
        *self = updated;
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> anyhow::Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow!("Invalid {} value: {}", key, value))
}

/// Runtime configuration for the lock client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConfig {
    /// Prepended to every key name given to the client
    pub key_prefix: String,

    /// Pause between acquisition attempts
    pub poll_interval: Duration,

    /// Upper bound of random extra delay per pause
    pub poll_jitter: Duration,

    /// Lease used by the `*_default` runners
    pub default_lease: Duration,

    /// Wait used by the `*_default` bounded runner
    pub default_wait: Duration,

    /// Stop polling after this many consecutive store failures (None = never)
    pub max_consecutive_store_errors: Option<u32>,
}

impl Default for LockConfig {
    fn default() -> Self {
        Config::default().lock_config()
    }
}

impl LockConfig {
    /// Set the key prefix
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set the poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the poll jitter
    pub fn with_poll_jitter(mut self, jitter: Duration) -> Self {
        self.poll_jitter = jitter;
        self
    }

    /// Set the default lease
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.default_lease = lease;
        self
    }

    /// Set the default wait
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.default_wait = wait;
        self
    }

    /// Give up after `limit` consecutive store failures
    pub fn with_store_error_limit(mut self, limit: u32) -> Self {
        self.max_consecutive_store_errors = Some(limit);
        self
    }

    /// Polling policy for the acquisition loop
    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: self.poll_interval,
            jitter: self.poll_jitter,
            max_consecutive_store_errors: self.max_consecutive_store_errors,
        }
    }
}
