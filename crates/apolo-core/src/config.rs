//! Application configuration
//!
//! This module provides centralized configuration management using the `config` crate.
//! Configuration can be loaded from environment variables and config files.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

/// Main application configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub rating_plans: RatingPlansConfig,
    #[serde(default)]
    pub mailer: MailerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Options that affect rating and debiting behavior
#[derive(Debug, Deserialize, Clone)]
pub struct GeneralConfig {
    /// Category used when a request omits it
    #[serde(default = "default_category")]
    pub default_category: String,

    /// Global scale for monetary rounding
    #[serde(default = "default_rounding_decimals")]
    pub rounding_decimals: u32,

    /// Outbound connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Outbound reply timeout in seconds
    #[serde(default = "default_reply_timeout")]
    pub reply_timeout_secs: u64,

    /// Accept invalid TLS certificates on HTTP notifications
    #[serde(default)]
    pub http_skip_tls_verify: bool,

    /// Number of POST attempts before spooling
    #[serde(default = "default_http_poster_attempts")]
    pub http_poster_attempts: u32,

    /// Directory receiving failed HTTP notifications
    #[serde(default = "default_http_failed_dir")]
    pub http_failed_dir: String,

    /// Minimum prefix length considered by destination matching
    #[serde(default = "default_min_prefix_match")]
    pub min_prefix_match: usize,
}

fn default_category() -> String {
    "call".to_string()
}

fn default_rounding_decimals() -> u32 {
    6
}

fn default_connect_timeout() -> u64 {
    1
}

fn default_reply_timeout() -> u64 {
    2
}

fn default_http_poster_attempts() -> u32 {
    3
}

fn default_http_failed_dir() -> String {
    "/var/spool/apolo/failed_posts".to_string()
}

fn default_min_prefix_match() -> usize {
    2
}

/// Storage backend configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// `memory` or `redis`
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// How long a known-absent catalog key stays cached, in milliseconds
    #[serde(default = "default_negative_cache_ttl")]
    pub negative_cache_ttl_ms: u64,
}

fn default_backend() -> String {
    "memory".to_string()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_negative_cache_ttl() -> u64 {
    5000
}

/// Rating plan cache options
#[derive(Debug, Deserialize, Clone, Default)]
pub struct RatingPlansConfig {
    /// Warm the catalog cache at startup
    #[serde(default)]
    pub precache: bool,
}

/// SMTP settings used by the mail notifier
#[derive(Debug, Deserialize, Clone)]
pub struct MailerConfig {
    /// SMTP server address (host:port)
    #[serde(default = "default_mail_server")]
    pub server: String,

    /// SMTP auth user
    #[serde(default)]
    pub auth_user: String,

    /// SMTP auth password
    #[serde(default)]
    pub auth_password: String,

    /// Sender address
    #[serde(default = "default_from_address")]
    pub from_address: String,
}

fn default_mail_server() -> String {
    "localhost:25".to_string()
}

fn default_from_address() -> String {
    "rater@apolo.local".to_string()
}

/// Action planner configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    /// Run the scheduler loop in the binary
    #[serde(default = "default_scheduler_enabled")]
    pub enabled: bool,

    /// Maximum tasks executed concurrently when draining the task queue
    #[serde(default = "default_task_concurrency")]
    pub task_concurrency: usize,
}

fn default_scheduler_enabled() -> bool {
    true
}

fn default_task_concurrency() -> usize {
    10
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Default level when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON formatted records
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from environment and optional config file
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Start with default values
            .set_default("general.default_category", default_category())?
            .set_default("general.rounding_decimals", 6)?
            .set_default("general.http_poster_attempts", 3)?
            .set_default("general.min_prefix_match", 2)?
            .set_default("storage.backend", default_backend())?
            .set_default("storage.negative_cache_ttl_ms", 5000)?
            .set_default("scheduler.task_concurrency", 10)?
            .set_default("logging.level", default_log_level())?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Load from environment variables with APOLO_ prefix
            .add_source(
                Environment::with_prefix("APOLO")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load configuration from a specific file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(Environment::with_prefix("APOLO").separator("__"))
            .build()?;

        config.try_deserialize()
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            default_category: default_category(),
            rounding_decimals: default_rounding_decimals(),
            connect_timeout_secs: default_connect_timeout(),
            reply_timeout_secs: default_reply_timeout(),
            http_skip_tls_verify: false,
            http_poster_attempts: default_http_poster_attempts(),
            http_failed_dir: default_http_failed_dir(),
            min_prefix_match: default_min_prefix_match(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            redis_url: default_redis_url(),
            negative_cache_ttl_ms: default_negative_cache_ttl(),
        }
    }
}

impl Default for MailerConfig {
    fn default() -> Self {
        Self {
            server: default_mail_server(),
            auth_user: String::new(),
            auth_password: String::new(),
            from_address: default_from_address(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_scheduler_enabled(),
            task_concurrency: default_task_concurrency(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}
