use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use strum::{Display, EnumString};
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_CACHE_BACKEND: &str = "in-memory";
const DEFAULT_CATALOG_TTL_SECS: u64 = 600;
const DEFAULT_CURRENCY: &str = "usd";
const DEFAULT_CHARGE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_DELAY_MS: u64 = 2000;
const DEFAULT_NOTIFICATION_TIMEOUT_SECS: u64 = 10;
const DEFAULT_SENDER: &str = "no-reply@ecommerce";

/// Cache configuration
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Backend to use: "in-memory", "redis" or "disabled"
    #[serde(default = "default_cache_backend")]
    #[validate(custom = "validate_cache_backend")]
    pub backend: String,

    /// Redis connection URL for the cache
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// TTL in seconds for catalog listings and single products
    #[serde(default = "default_catalog_ttl_secs")]
    #[validate(range(min = 1))]
    pub catalog_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: default_cache_backend(),
            redis_url: default_redis_url(),
            catalog_ttl_secs: default_catalog_ttl_secs(),
        }
    }
}

impl CacheConfig {
    pub fn catalog_ttl(&self) -> Duration {
        Duration::from_secs(self.catalog_ttl_secs)
    }
}

/// What happens to an order whose charge did not succeed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PaymentFailurePolicy {
    /// Leave the order's payment status at `pending` for later reconciliation
    #[default]
    KeepPending,
    /// Record the payment status as `failed`
    MarkFailed,
}

/// Payment processor configuration
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct PaymentConfig {
    /// Charge the order during checkout
    #[serde(default)]
    pub enabled: bool,

    /// Processor API base URL
    #[serde(default = "default_payment_base_url")]
    pub base_url: String,

    /// Processor secret key
    #[serde(default)]
    pub secret_key: String,

    #[serde(default = "default_currency")]
    #[validate(length(equal = 3))]
    pub currency: String,

    /// Deadline for a whole charge, retries included
    #[serde(default = "default_charge_timeout_secs")]
    #[validate(range(min = 1, max = 120))]
    pub charge_timeout_secs: u64,

    #[serde(default = "default_max_attempts")]
    #[validate(range(min = 1, max = 10))]
    pub max_attempts: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default)]
    pub failure_policy: PaymentFailurePolicy,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: default_payment_base_url(),
            secret_key: String::new(),
            currency: default_currency(),
            charge_timeout_secs: default_charge_timeout_secs(),
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            failure_policy: PaymentFailurePolicy::default(),
        }
    }
}

impl PaymentConfig {
    pub fn charge_timeout(&self) -> Duration {
        Duration::from_secs(self.charge_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Notification channel configuration. A channel without credentials is not registered.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct NotificationConfig {
    #[serde(default)]
    pub mailgun_domain: Option<String>,

    #[serde(default)]
    pub mailgun_api_key: Option<String>,

    #[serde(default = "default_mailgun_base_url")]
    pub mailgun_base_url: String,

    #[serde(default = "default_sender")]
    #[validate(length(min = 3))]
    pub sender: String,

    #[serde(default)]
    pub fcm_server_key: Option<String>,

    #[serde(default = "default_fcm_url")]
    pub fcm_url: String,

    #[serde(default = "default_notification_timeout_secs")]
    #[validate(range(min = 1, max = 120))]
    pub timeout_secs: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            mailgun_domain: None,
            mailgun_api_key: None,
            mailgun_base_url: default_mailgun_base_url(),
            sender: default_sender(),
            fcm_server_key: None,
            fcm_url: default_fcm_url(),
            timeout_secs: default_notification_timeout_secs(),
        }
    }
}

impl NotificationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    #[validate(length(min = 1))]
    pub database_url: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    #[validate(length(min = 1))]
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,

    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,

    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Capacity of the in-process domain event channel
    #[serde(default = "default_event_channel_capacity")]
    #[validate(range(min = 1))]
    pub event_channel_capacity: usize,

    #[serde(default)]
    #[validate]
    pub cache: CacheConfig,

    #[serde(default)]
    #[validate]
    pub payment: PaymentConfig,

    #[serde(default)]
    #[validate]
    pub notifications: NotificationConfig,
}

impl AppConfig {
    /// Builds a configuration with defaults for everything but the connection and bind address.
    pub fn new(database_url: String, host: String, port: u16, environment: String) -> Self {
        Self {
            database_url,
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            event_channel_capacity: default_event_channel_capacity(),
            cache: CacheConfig::default(),
            payment: PaymentConfig::default(),
            notifications: NotificationConfig::default(),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if self.payment.enabled && self.payment.secret_key.trim().is_empty() {
            let mut err = ValidationError::new("payment_secret_key_required");
            err.message =
                Some("Set APP__PAYMENT__SECRET_KEY when payments are enabled".into());
            errors.add("payment", err);
        }

        if self.db_min_connections > self.db_max_connections {
            let mut err = ValidationError::new("db_pool_bounds");
            err.message = Some("db_min_connections must not exceed db_max_connections".into());
            errors.add("db_min_connections", err);
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_cache_backend() -> String {
    DEFAULT_CACHE_BACKEND.to_string()
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_catalog_ttl_secs() -> u64 {
    DEFAULT_CATALOG_TTL_SECS
}

fn default_payment_base_url() -> String {
    "https://api.stripe.com".to_string()
}

fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}

fn default_charge_timeout_secs() -> u64 {
    DEFAULT_CHARGE_TIMEOUT_SECS
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_retry_delay_ms() -> u64 {
    DEFAULT_RETRY_DELAY_MS
}

fn default_mailgun_base_url() -> String {
    "https://api.mailgun.net".to_string()
}

fn default_sender() -> String {
    DEFAULT_SENDER.to_string()
}

fn default_fcm_url() -> String {
    "https://fcm.googleapis.com/fcm/send".to_string()
}

fn default_notification_timeout_secs() -> u64 {
    DEFAULT_NOTIFICATION_TIMEOUT_SECS
}

fn default_db_max_connections() -> u32 {
    16
}
fn default_db_min_connections() -> u32 {
    2
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}

fn default_event_channel_capacity() -> usize {
    1024
}

fn validate_cache_backend(value: &str) -> Result<(), ValidationError> {
    match value.to_ascii_lowercase().as_str() {
        "in-memory" | "redis" | "disabled" => Ok(()),
        _ => {
            let mut err = ValidationError::new("cache_backend");
            err.message = Some("Must be one of: in-memory, redis, disabled".into());
            Err(err)
        }
    }
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("storefront_api={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    let filter = EnvFilter::new(filter_directive);
    if json {
        let _ = fmt().with_env_filter(filter).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter).try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    load_config_from(CONFIG_DIR, &run_env)
}

fn load_config_from(config_dir: &str, run_env: &str) -> Result<AppConfig, AppConfigError> {
    let config = Config::builder()
        .set_default("database_url", "sqlite://storefront.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT as i64)?
        .set_default("environment", run_env)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", config_dir)).required(false))
        .add_source(File::with_name(&format!("{}/{}", config_dir, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn base_config() -> AppConfig {
        AppConfig::new(
            "sqlite::memory:".into(),
            "127.0.0.1".into(),
            8080,
            "development".into(),
        )
    }

    fn write_config(dir: &TempDir, filename: &str, content: &str) {
        let mut file = std::fs::File::create(dir.path().join(filename)).unwrap();
        writeln!(file, "{}", content).unwrap();
    }

    #[test]
    fn defaults_match_checkout_contract() {
        let cfg = base_config();
        assert_eq!(cfg.cache.catalog_ttl(), Duration::from_secs(600));
        assert_eq!(cfg.payment.charge_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.payment.max_attempts, 3);
        assert_eq!(cfg.payment.retry_delay(), Duration::from_millis(2000));
        assert_eq!(cfg.payment.currency, "usd");
        assert_eq!(cfg.payment.failure_policy, PaymentFailurePolicy::KeepPending);
        assert_eq!(cfg.notifications.sender, "no-reply@ecommerce");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn enabled_payments_require_secret_key() {
        let mut cfg = base_config();
        cfg.payment.enabled = true;
        assert!(cfg.validate_additional_constraints().is_err());

        cfg.payment.secret_key = "sk_test_123".into();
        assert!(cfg.validate_additional_constraints().is_ok());
    }

    #[test]
    fn rejects_unknown_cache_backend() {
        let mut cfg = base_config();
        cfg.cache.backend = "memcached".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn loads_layered_files() {
        let dir = TempDir::new().unwrap();
        write_config(
            &dir,
            "default.toml",
            r#"
            database_url = "postgres://localhost/storefront"
            port = 9000

            [payment]
            failure_policy = "mark_failed"
            max_attempts = 5
            "#,
        );
        write_config(
            &dir,
            "staging.toml",
            r#"
            port = 9100

            [cache]
            backend = "disabled"
            "#,
        );

        let cfg = load_config_from(dir.path().to_str().unwrap(), "staging").unwrap();
        assert_eq!(cfg.database_url, "postgres://localhost/storefront");
        assert_eq!(cfg.port, 9100);
        assert_eq!(cfg.environment, "staging");
        assert_eq!(cfg.cache.backend, "disabled");
        assert_eq!(cfg.payment.failure_policy, PaymentFailurePolicy::MarkFailed);
        assert_eq!(cfg.payment.max_attempts, 5);
    }

    #[test]
    fn invalid_log_level_fails_validation() {
        let dir = TempDir::new().unwrap();
        write_config(&dir, "default.toml", r#"log_level = "loud""#);

        let result = load_config_from(dir.path().to_str().unwrap(), "test");
        assert!(matches!(result, Err(AppConfigError::Validation(_))));
    }
}
