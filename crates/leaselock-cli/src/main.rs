//! Leaselock CLI - distributed locks from the shell

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use leaselock_core::config::Config;
use leaselock_core::locking::{CriticalSectionError, LockClient, LockKey, OwnershipToken};
use serde::Serialize;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

#[derive(Parser)]
#[command(name = "leaselock")]
#[command(author, version, about = "Lease-based distributed locks on Redis", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Redis URL, overriding the config file and LEASELOCK_REDIS_URL
    #[arg(long, global = true)]
    redis_url: Option<String>,
}

#[derive(Clone, Copy, Default, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire a lock and print its ownership token
    Acquire {
        /// Lock key
        key: String,
        /// Lease in seconds (defaults to lock.default_lease_secs)
        #[arg(short, long)]
        lease: Option<u64>,
        /// Maximum wait in seconds (defaults to lock.default_wait_secs)
        #[arg(short, long)]
        wait: Option<u64>,
    },

    /// Release a lock held by TOKEN
    Release {
        /// Lock key
        key: String,
        /// Ownership token printed by `acquire`
        #[arg(required_unless_present = "force")]
        token: Option<String>,
        /// Delete the lock whoever holds it
        #[arg(long)]
        force: bool,
    },

    /// Show who holds a lock
    Status {
        /// Lock key
        key: String,
        /// Report whether this token is the holder
        #[arg(short, long)]
        token: Option<String>,
    },

    /// Run a command while holding a lock
    Run {
        /// Lock key
        key: String,
        /// Lease in seconds (defaults to lock.default_lease_secs)
        #[arg(short, long)]
        lease: Option<u64>,
        /// Maximum wait in seconds (defaults to lock.default_wait_secs)
        #[arg(short, long)]
        wait: Option<u64>,
        /// Command and arguments to run
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective configuration
    Show,
    /// Show config file path
    Path,
    /// Get a configuration value
    Get { key: String },
    /// Set a configuration value
    Set { key: String, value: String },
}

#[derive(Serialize)]
struct AcquireReport {
    key: String,
    token: String,
    lease_secs: u64,
    acquired_at: DateTime<Utc>,
    attempts: u32,
    waited_ms: u128,
}

#[derive(Serialize)]
struct ReleaseReport {
    key: String,
    outcome: String,
}

#[derive(Serialize)]
struct StatusReport {
    key: String,
    status: String,
    holder: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout stays clean for tokens and JSON
    let default_level = if cli.quiet { "leaselock=warn" } else { "leaselock=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let output = Output {
        format: cli.format,
        quiet: cli.quiet,
    };
    let redis_url = cli.redis_url.as_deref();

    match cli.command {
        Commands::Acquire { key, lease, wait } => {
            cmd_acquire(redis_url, &key, lease, wait, output).await
        }

        Commands::Release { key, token, force } => {
            cmd_release(redis_url, &key, token.as_deref(), force, output).await
        }

        Commands::Status { key, token } => {
            cmd_status(redis_url, &key, token.as_deref(), output).await
        }

        Commands::Run {
            key,
            lease,
            wait,
            command,
        } => {
            let code = cmd_run(redis_url, &key, lease, wait, &command).await?;
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }

        Commands::Config { action } => cmd_config(action, output),
    }
}

#[derive(Clone, Copy)]
struct Output {
    format: OutputFormat,
    quiet: bool,
}

impl Output {
    fn json<T: Serialize>(&self, value: &T) -> anyhow::Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn load_config(redis_url: Option<&str>) -> anyhow::Result<Config> {
    let mut config = Config::load()?;
    if let Some(url) = redis_url {
        config.store.url = url.to_string();
        config.validate()?;
    }
    Ok(config)
}

/// Validate the key before touching the network
fn lock_key(config: &Config, name: &str) -> anyhow::Result<LockKey> {
    Ok(LockKey::with_prefix(&config.lock.key_prefix, name)?)
}

async fn connect(config: &Config) -> anyhow::Result<LockClient> {
    debug!(url = %config.store.redacted_url(), "Connecting to lock store");
    LockClient::connect(config)
        .await
        .context("Failed to connect to the lock store")
}

fn lease_or_default(config: &Config, secs: Option<u64>) -> Duration {
    Duration::from_secs(secs.unwrap_or(config.lock.default_lease_secs))
}

fn wait_or_default(config: &Config, secs: Option<u64>) -> Duration {
    Duration::from_secs(secs.unwrap_or(config.lock.default_wait_secs))
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn cmd_acquire(
    redis_url: Option<&str>,
    name: &str,
    lease: Option<u64>,
    wait: Option<u64>,
    output: Output,
) -> anyhow::Result<()> {
    let config = load_config(redis_url)?;
    lock_key(&config, name)?;
    let lease = lease_or_default(&config, lease);
    let wait = wait_or_default(&config, wait);

    let client = connect(&config).await?;
    let guard = client.acquire_timeout(name, lease, wait).await?;

    let report = AcquireReport {
        key: guard.key().to_string(),
        token: guard.token().to_string(),
        lease_secs: lease.as_secs(),
        acquired_at: guard.acquired_at(),
        attempts: guard.acquisition().attempts,
        waited_ms: guard.acquisition().waited.as_millis(),
    };

    // The lock outlives this process until released or expired
    guard.detach();

    match output.format {
        OutputFormat::Json => output.json(&report)?,
        OutputFormat::Text if output.quiet => println!("{}", report.token),
        OutputFormat::Text => {
            println!("Acquired lock: {}", report.key);
            println!("  Token:    {}", report.token);
            println!("  Lease:    {}s", report.lease_secs);
            println!("  Acquired: {}", report.acquired_at.to_rfc3339());
            println!("  Attempts: {} ({}ms)", report.attempts, report.waited_ms);
        }
    }
    Ok(())
}

async fn cmd_release(
    redis_url: Option<&str>,
    name: &str,
    token: Option<&str>,
    force: bool,
    output: Output,
) -> anyhow::Result<()> {
    let config = load_config(redis_url)?;
    let key = lock_key(&config, name)?;
    let client = connect(&config).await?;

    let outcome = if force {
        let removed = client.primitive().force_release(&key).await?;
        let outcome = if removed { "released" } else { "not-held" };
        outcome.to_string()
    } else {
        let token = token.context("A token is required unless --force is given")?;
        client
            .release(name, &OwnershipToken::from_existing(token))
            .await?
            .to_string()
    };

    let report = ReleaseReport {
        key: key.to_string(),
        outcome,
    };
    match output.format {
        OutputFormat::Json => output.json(&report)?,
        OutputFormat::Text if output.quiet => {}
        OutputFormat::Text => println!("{}: {}", report.key, report.outcome),
    }
    Ok(())
}

async fn cmd_status(
    redis_url: Option<&str>,
    name: &str,
    token: Option<&str>,
    output: Output,
) -> anyhow::Result<()> {
    let config = load_config(redis_url)?;
    let key = lock_key(&config, name)?;
    let client = connect(&config).await?;

    let token = token.map(OwnershipToken::from_existing);
    let status = client.primitive().status(&key, token.as_ref()).await?;
    let holder = client.primitive().holder(&key).await?;

    let report = StatusReport {
        key: key.to_string(),
        status: status.to_string(),
        holder: holder.map(|t| t.to_string()),
    };
    match output.format {
        OutputFormat::Json => output.json(&report)?,
        OutputFormat::Text if output.quiet => println!("{}", report.status),
        OutputFormat::Text => {
            println!("{}: {}", report.key, report.status);
            if let Some(holder) = &report.holder {
                println!("  Holder: {}", holder);
            }
        }
    }
    Ok(())
}

/// Returns the command's exit code
async fn cmd_run(
    redis_url: Option<&str>,
    name: &str,
    lease: Option<u64>,
    wait: Option<u64>,
    command: &[String],
) -> anyhow::Result<i32> {
    let config = load_config(redis_url)?;
    lock_key(&config, name)?;
    let lease = lease_or_default(&config, lease);
    let wait = wait_or_default(&config, wait);

    let (program, args) = command
        .split_first()
        .context("No command given after `--`")?;

    let client = connect(&config).await?;
    let result = client
        .run_exclusive_or_timeout(name, lease, wait, || async {
            Command::new(program)
                .args(args)
                .kill_on_drop(true)
                .status()
                .await
        })
        .await;

    match result {
        Ok(status) => {
            debug!(lock_key = name, %status, "Command finished");
            Ok(status.code().unwrap_or(1))
        }
        Err(CriticalSectionError::Lock(e)) => Err(e.into()),
        Err(CriticalSectionError::Work(e)) => {
            Err(anyhow::Error::new(e).context(format!("Failed to run `{}`", program)))
        }
    }
}

fn cmd_config(action: ConfigAction, output: Output) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            let config = Config::load()?.redacted();
            match output.format {
                OutputFormat::Json => output.json(&config)?,
                OutputFormat::Text => print!("{}", toml::to_string_pretty(&config)?),
            }
        }
        ConfigAction::Path => {
            let path = Config::config_path()?;
            println!("{}", path.display());
        }
        ConfigAction::Get { key } => {
            let config = Config::load()?;
            let value = config.get(&key)?;
            println!("{}", value);
        }
        ConfigAction::Set { key, value } => {
            // Edit the file as written, without environment overrides
            let path = Config::config_path()?;
            let mut config = Config::load_from(&path)?;
            config.set(&key, &value)?;
            config.save_to(&path)?;
            if !output.quiet {
                let shown = match key.as_str() {
                    "store.url" => config.store.redacted_url(),
                    _ => value,
                };
                println!("Set {} = {}", key, shown);
            }
        }
    }
    Ok(())
}
