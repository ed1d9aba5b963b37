use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::dunning::{MAX_ATTEMPTS, RETRY_INTERVAL_DAYS};
use crate::provider::BaseProviderConfig;

/// Webhook secret format: `whsec_` + hex(32 random bytes).
pub const WEBHOOK_SECRET_BYTES: usize = 32;
pub const WEBHOOK_SECRET_PREFIX: &str = "whsec_";
pub const WEBHOOK_SECRET_PREVIEW_CHARS: usize = 8;

/// API key format: `ck_` + secret; listings show the first 6 secret chars.
pub const API_KEY_PREFIX: &str = "ck_";
pub const API_KEY_START_CHARS: usize = 6;
pub const API_KEY_NAME_MAX_LENGTH: usize = 32;

/// Main configuration structure for chainbill
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub provider: ProviderConfig,

    #[serde(default)]
    pub dunning: DunningConfig,

    #[serde(default)]
    pub webhooks: WebhookConfig,

    #[serde(default)]
    pub api_keys: ApiKeyConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub auth: AuthConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &str) -> Result<Self, crate::Error> {
        use crate::Error;

        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, crate::Error> {
        // Try to load from CHAINBILL_CONFIG env var first
        if let Ok(config_path) = std::env::var("CHAINBILL_CONFIG") {
            return Self::load(&config_path);
        }

        // Try default locations
        let default_paths = [
            "./config/default.toml",
            "./config/production.toml",
            "/etc/chainbill/config.toml",
        ];

        for path in &default_paths {
            if Path::new(path).exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        use crate::Error;

        if self.database.pool_size == 0 {
            return Err(Error::Config("Database pool size must be > 0".to_string()));
        }

        if self.dunning.max_attempts as usize != self.dunning.retry_interval_days.len() {
            return Err(Error::Config(
                "Dunning retry intervals must match max_attempts".to_string(),
            ));
        }

        if self.webhooks.delivery.max_attempts == 0 {
            return Err(Error::Config(
                "Webhook delivery max_attempts must be > 0".to_string(),
            ));
        }

        if self.scheduler.claim_batch == 0 {
            return Err(Error::Config("Scheduler claim batch must be > 0".to_string()));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,

    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            pool_size: default_pool_size(),
        }
    }
}

fn default_database_url() -> String {
    "postgres://localhost/chainbill".to_string()
}

fn default_pool_size() -> u32 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,

    #[serde(default = "default_redis_namespace")]
    pub namespace: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            namespace: default_redis_namespace(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_redis_namespace() -> String {
    "chainbill".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub base: BaseProviderConfig,
}

/// Dunning schedule; defaults are the canonical values from `dunning`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DunningConfig {
    #[serde(default = "default_dunning_max_attempts")]
    pub max_attempts: i32,

    #[serde(default = "default_dunning_intervals")]
    pub retry_interval_days: Vec<i64>,
}

impl Default for DunningConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_dunning_max_attempts(),
            retry_interval_days: default_dunning_intervals(),
        }
    }
}

fn default_dunning_max_attempts() -> i32 {
    MAX_ATTEMPTS
}

fn default_dunning_intervals() -> Vec<i64> {
    RETRY_INTERVAL_DAYS.to_vec()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Require HTTPS destination URLs (production default).
    #[serde(default = "default_true")]
    pub require_https: bool,

    #[serde(default)]
    pub delivery: DeliveryRetryConfig,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            require_https: true,
            delivery: DeliveryRetryConfig::default(),
        }
    }
}

/// Exponential backoff for webhook delivery and upstream-error redelivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRetryConfig {
    #[serde(default = "default_base_delay")]
    pub base_delay_secs: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: u32,

    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for DeliveryRetryConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: default_base_delay(),
            multiplier: default_multiplier(),
            max_delay_secs: default_max_delay(),
            max_attempts: default_max_attempts(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_base_delay() -> u64 {
    5
}

fn default_multiplier() -> u32 {
    2
}

fn default_max_delay() -> u64 {
    600
}

fn default_max_attempts() -> u32 {
    10
}

fn default_request_timeout() -> u64 {
    15
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyConfig {
    #[serde(default = "default_api_key_name_max")]
    pub name_max_length: usize,
}

impl Default for ApiKeyConfig {
    fn default() -> Self {
        Self {
            name_max_length: default_api_key_name_max(),
        }
    }
}

fn default_api_key_name_max() -> usize {
    API_KEY_NAME_MAX_LENGTH
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Dispatcher tick interval.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Upper bound on orders pulled into processing per tick.
    #[serde(default = "default_claim_batch")]
    pub claim_batch: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            claim_batch: default_claim_batch(),
        }
    }
}

fn default_poll_interval() -> u64 {
    5
}

fn default_claim_batch() -> i64 {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// PEM public key used to validate CDP JWTs; empty disables validation.
    #[serde(default)]
    pub cdp_public_key_pem: String,

    #[serde(default = "default_cdp_issuer")]
    pub cdp_issuer: String,

    #[serde(default)]
    pub cdp_audience: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            cdp_public_key_pem: String::new(),
            cdp_issuer: default_cdp_issuer(),
            cdp_audience: None,
        }
    }
}

fn default_cdp_issuer() -> String {
    "https://auth.cdp.example".to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_policy_constants() {
        let config = Config::default();
        assert_eq!(config.dunning.max_attempts, 4);
        assert_eq!(config.dunning.retry_interval_days, vec![2, 7, 14, 21]);
        assert_eq!(config.webhooks.delivery.base_delay_secs, 5);
        assert_eq!(config.webhooks.delivery.multiplier, 2);
        assert_eq!(config.webhooks.delivery.max_delay_secs, 600);
        assert_eq!(config.webhooks.delivery.max_attempts, 10);
        assert!(config.webhooks.require_https);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_mismatched_dunning() {
        let mut config = Config::default();
        config.dunning.retry_interval_days = vec![2, 7];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [database]
            url = "postgres://db.internal/billing"

            [webhooks]
            require_https = false
            "#,
        )
        .unwrap();
        assert_eq!(config.database.url, "postgres://db.internal/billing");
        assert!(!config.webhooks.require_https);
        assert_eq!(config.scheduler.claim_batch, 50);
    }
}
