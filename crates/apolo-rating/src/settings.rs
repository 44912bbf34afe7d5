//! Engine settings derived from the application configuration

use std::time::Duration;

use apolo_core::config::{AppConfig, GeneralConfig};
use apolo_core::constants::{DEFAULT_ROUNDING_DECIMALS, MIN_PREFIX_MATCH};

/// Knobs shared by the rating and debit pipeline
#[derive(Debug, Clone)]
pub struct RatingSettings {
    /// Global rounding scale
    pub rounding_decimals: u32,
    /// Shortest destination prefix considered when matching
    pub min_prefix_match: usize,
    /// Category used when a request carries none
    pub default_category: String,
    /// Maximum wait for per-account locks, unbounded when `None`
    pub lock_timeout: Option<Duration>,
}

impl Default for RatingSettings {
    fn default() -> Self {
        Self {
            rounding_decimals: DEFAULT_ROUNDING_DECIMALS,
            min_prefix_match: MIN_PREFIX_MATCH,
            default_category: "call".to_string(),
            lock_timeout: None,
        }
    }
}

impl From<&GeneralConfig> for RatingSettings {
    fn from(general: &GeneralConfig) -> Self {
        Self {
            rounding_decimals: general.rounding_decimals,
            min_prefix_match: general.min_prefix_match,
            default_category: general.default_category.clone(),
            lock_timeout: None,
        }
    }
}

/// Knobs of the action runtime and its notifiers
#[derive(Debug, Clone)]
pub struct ActionSettings {
    /// Delivery attempts for `*call_url` posts
    pub http_attempts: u32,
    /// Spool directory for posts that could not be delivered, disabled when empty
    pub http_failed_dir: String,
    pub http_skip_tls_verify: bool,
    pub connect_timeout: Duration,
    pub reply_timeout: Duration,
    /// Delivery attempts for `*mail_async`
    pub mail_attempts: u32,
    /// Delay unit between mail attempts, multiplied by the attempt number
    pub mail_backoff: Duration,
    pub rounding_decimals: u32,
}

impl Default for ActionSettings {
    fn default() -> Self {
        Self {
            http_attempts: 3,
            http_failed_dir: String::new(),
            http_skip_tls_verify: false,
            connect_timeout: Duration::from_secs(1),
            reply_timeout: Duration::from_secs(2),
            mail_attempts: apolo_core::constants::MAIL_ATTEMPTS,
            mail_backoff: Duration::from_secs(60),
            rounding_decimals: DEFAULT_ROUNDING_DECIMALS,
        }
    }
}

impl From<&AppConfig> for ActionSettings {
    fn from(config: &AppConfig) -> Self {
        let general = &config.general;
        Self {
            http_attempts: general.http_poster_attempts.max(1),
            http_failed_dir: general.http_failed_dir.clone(),
            http_skip_tls_verify: general.http_skip_tls_verify,
            connect_timeout: Duration::from_secs(general.connect_timeout_secs),
            reply_timeout: Duration::from_secs(general.reply_timeout_secs),
            rounding_decimals: general.rounding_decimals,
            ..Default::default()
        }
    }
}
