//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration files (config/default.toml, config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Fixed product string sent with every outbound federation request.
pub const DEFAULT_USER_AGENT: &str = concat!("Pressfed/", env!("CARGO_PKG_VERSION"));

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub activitypub: ActivityPubConfig,
    pub queue: QueueConfig,
    /// Local accounts keyed by name (the `{name}` of `acct:{name}@{domain}`)
    #[serde(default)]
    pub accounts: BTreeMap<String, AccountConfig>,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "blog.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the public address of the site
    ///
    /// # Returns
    /// Full URL like "https://blog.example.com"
    pub fn public_address(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// ActivityPub configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ActivityPubConfig {
    /// Turn federation on or off entirely
    pub enabled: bool,
    /// RSA private key in PEM format (PKCS#1 or PKCS#8)
    pub key_path: PathBuf,
    /// User-Agent for outbound requests
    pub user_agent: String,
}

/// Delivery queue tuning
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// How often the worker looks for due items
    pub poll_interval_seconds: u64,
    /// Failed attempts before an item is dropped and its inbox evicted
    pub max_attempts: u32,
    /// Retry delay unit; the n-th retry waits `n * retry_delay_seconds`
    pub retry_delay_seconds: u64,
    /// Deliveries running at the same time
    pub max_concurrent_deliveries: usize,
    /// Time in-flight deliveries get to finish after shutdown starts
    pub shutdown_grace_seconds: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 60,
            max_attempts: 20,
            retry_delay_seconds: 600,
            max_concurrent_deliveries: 10,
            shutdown_grace_seconds: 5,
        }
    }
}

/// A local publishing account
#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    /// Path of the account below the public address (e.g., "/alice")
    pub path: String,
    /// Human readable name for the actor document
    pub display_name: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (PRESSFED__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let defaults = QueueConfig::default();
        let config = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.protocol", "https")?
            .set_default("database.path", "data/pressfed.db")?
            .set_default("activitypub.enabled", true)?
            .set_default("activitypub.key_path", "data/private.pem")?
            .set_default("activitypub.user_agent", DEFAULT_USER_AGENT)?
            .set_default(
                "queue.poll_interval_seconds",
                defaults.poll_interval_seconds as i64,
            )?
            .set_default("queue.max_attempts", defaults.max_attempts as i64)?
            .set_default(
                "queue.retry_delay_seconds",
                defaults.retry_delay_seconds as i64,
            )?
            .set_default(
                "queue.max_concurrent_deliveries",
                defaults.max_concurrent_deliveries as i64,
            )?
            .set_default(
                "queue.shutdown_grace_seconds",
                defaults.shutdown_grace_seconds as i64,
            )?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("PRESSFED")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    pub(crate) fn validate(&self) -> Result<(), crate::error::AppError> {
        use crate::error::AppError;

        if self.activitypub.enabled && self.accounts.is_empty() {
            return Err(AppError::Config(
                "at least one account is required when activitypub.enabled=true".to_string(),
            ));
        }

        let mut paths: BTreeMap<&str, &str> = BTreeMap::new();
        for (name, account) in &self.accounts {
            if name.is_empty() || name.contains(['/', '@']) {
                return Err(AppError::Config(format!("invalid account name: {name:?}")));
            }
            if !account.path.starts_with('/') {
                return Err(AppError::Config(format!(
                    "accounts.{name}.path must start with '/'"
                )));
            }
            if account.path.contains("//") || account.path.contains([':', '*', '{', '}']) {
                return Err(AppError::Config(format!(
                    "accounts.{name}.path is not a plain path: {:?}",
                    account.path
                )));
            }
            if collides_with_builtin_route(&account.path) {
                return Err(AppError::Config(format!(
                    "accounts.{name}.path {:?} collides with a built-in route",
                    account.path
                )));
            }
            if let Some(other) = paths.insert(account.path.as_str(), name.as_str()) {
                return Err(AppError::Config(format!(
                    "accounts.{name}.path {:?} is already used by account {other:?}",
                    account.path
                )));
            }
        }

        if self.queue.max_attempts == 0 {
            return Err(AppError::Config(
                "queue.max_attempts must be greater than 0".to_string(),
            ));
        }
        if self.queue.max_attempts > MAX_ATTEMPTS_LIMIT {
            return Err(AppError::Config(format!(
                "queue.max_attempts must be at most {MAX_ATTEMPTS_LIMIT}"
            )));
        }
        if self.queue.retry_delay_seconds > MAX_RETRY_DELAY_SECONDS {
            return Err(AppError::Config(format!(
                "queue.retry_delay_seconds must be at most {MAX_RETRY_DELAY_SECONDS}"
            )));
        }
        if self.queue.poll_interval_seconds == 0 {
            return Err(AppError::Config(
                "queue.poll_interval_seconds must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Upper bounds keeping `attempts * retry_delay` far from overflow
const MAX_ATTEMPTS_LIMIT: u32 = 1_000;
const MAX_RETRY_DELAY_SECONDS: u64 = 7 * 24 * 60 * 60;

/// Paths served by the router regardless of configured accounts
const BUILTIN_PATHS: &[&str] = &["/health", "/metrics", "/nodeinfo"];

/// Whether an account path would shadow or duplicate one of the fixed
/// routes: discovery under `/.well-known`, `/inbox/{name}` and
/// `/{name}/inbox` or `/{name}/followers`
fn collides_with_builtin_route(path: &str) -> bool {
    let trimmed = path.trim_end_matches('/');
    if BUILTIN_PATHS.contains(&trimmed) {
        return true;
    }

    let segments: Vec<&str> = trimmed.trim_start_matches('/').split('/').collect();
    matches!(
        segments.as_slice(),
        [".well-known", ..] | ["inbox", _] | [_, "inbox" | "followers"]
    )
}
