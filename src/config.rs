use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_CURRENCY: &str = "INR";
const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 30 * 60;
const DEFAULT_PENDING_TIMEOUT_SECS: u64 = 30 * 60;
const DEFAULT_CLEANUP_GRACE_SECS: u64 = 10;
const DEFAULT_PAYMENT_FLAGS_REFRESH_SECS: u64 = 15;

/// Shipping cost rule: free at or above the threshold, flat fee otherwise.
#[derive(Clone, Debug, Deserialize)]
pub struct ShippingConfig {
    #[serde(default = "default_free_shipping_threshold")]
    pub free_shipping_threshold: Decimal,
    #[serde(default = "default_flat_shipping_fee")]
    pub flat_fee: Decimal,
}

impl Default for ShippingConfig {
    fn default() -> Self {
        Self {
            free_shipping_threshold: default_free_shipping_threshold(),
            flat_fee: default_flat_shipping_fee(),
        }
    }
}

impl ShippingConfig {
    pub fn shipping_cost(&self, subtotal: Decimal) -> Decimal {
        if subtotal <= Decimal::ZERO || subtotal >= self.free_shipping_threshold {
            Decimal::ZERO
        } else {
            self.flat_fee
        }
    }
}

/// Redirect payment gateway credentials. Leaving `base_url` or `merchant_id`
/// unset runs the gateway path in "not configured" demo mode.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub merchant_id: Option<String>,
    /// Shared secret used to sign outgoing requests and verify callbacks
    #[serde(default)]
    pub secret: Option<String>,
    /// Where the gateway sends the shopper after payment
    #[serde(default)]
    pub redirect_url: Option<String>,
    /// Server-to-server callback URL registered with the gateway
    #[serde(default)]
    pub callback_url: Option<String>,
    #[serde(default = "default_gateway_timeout_secs")]
    pub timeout_secs: u64,
}

impl GatewayConfig {
    pub fn is_configured(&self) -> bool {
        let present = |v: &Option<String>| v.as_deref().map_or(false, |s| !s.trim().is_empty());
        present(&self.base_url) && present(&self.merchant_id) && present(&self.secret)
    }
}

/// Where stock snapshots come from: a catalog URL, a JSON file, or nothing.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct StockConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub file: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CleanupConfig {
    #[serde(default = "default_true_bool")]
    pub enabled: bool,
    #[serde(default = "default_cleanup_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_pending_timeout_secs")]
    pub pending_timeout_secs: u64,
    #[serde(default = "default_cleanup_grace_secs")]
    pub grace_delay_secs: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_cleanup_interval_secs(),
            pending_timeout_secs: default_pending_timeout_secs(),
            grace_delay_secs: default_cleanup_grace_secs(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct PaymentMethodsConfig {
    #[serde(default = "default_true_bool")]
    pub cod_enabled: bool,
    #[serde(default = "default_true_bool")]
    pub gateway_enabled: bool,
    #[serde(default = "default_payment_flags_refresh_secs")]
    pub refresh_secs: u64,
}

impl Default for PaymentMethodsConfig {
    fn default() -> Self {
        Self {
            cod_enabled: true,
            gateway_enabled: true,
            refresh_secs: default_payment_flags_refresh_secs(),
        }
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Secret shared with the identity provider for verifying bearer tokens
    #[validate(length(min = 32, message = "jwt_secret must be at least 32 characters"))]
    pub jwt_secret: String,

    #[serde(default = "default_auth_issuer")]
    pub auth_issuer: String,

    #[serde(default = "default_auth_audience")]
    pub auth_audience: String,

    /// Server host address
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// CORS: comma-separated list of allowed origins
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,

    #[serde(default = "default_event_channel_capacity")]
    #[validate(range(min = 1, message = "event_channel_capacity must be greater than 0"))]
    pub event_channel_capacity: usize,

    #[serde(default = "default_currency")]
    pub currency: String,

    #[serde(default)]
    pub shipping: ShippingConfig,

    #[serde(default)]
    pub payment_methods: PaymentMethodsConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub stock: StockConfig,

    #[serde(default)]
    pub cleanup: CleanupConfig,
}

impl AppConfig {
    /// Creates a configuration with defaults for everything but the essentials.
    pub fn new(database_url: String, jwt_secret: String, environment: String) -> Self {
        Self {
            database_url,
            jwt_secret,
            auth_issuer: default_auth_issuer(),
            auth_audience: default_auth_audience(),
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            cors_allowed_origins: None,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            event_channel_capacity: default_event_channel_capacity(),
            currency: default_currency(),
            shipping: ShippingConfig::default(),
            payment_methods: PaymentMethodsConfig::default(),
            gateway: GatewayConfig::default(),
            stock: StockConfig::default(),
            cleanup: CleanupConfig::default(),
        }
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup.interval_secs)
    }

    pub fn pending_timeout(&self) -> Duration {
        Duration::from_secs(self.cleanup.pending_timeout_secs)
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

fn default_auth_issuer() -> String {
    "storefront-auth".to_string()
}

fn default_auth_audience() -> String {
    "storefront-api".to_string()
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

fn default_event_channel_capacity() -> usize {
    1024
}

fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}

fn default_true_bool() -> bool {
    true
}

fn default_free_shipping_threshold() -> Decimal {
    Decimal::from(1000)
}

fn default_flat_shipping_fee() -> Decimal {
    Decimal::from(99)
}

fn default_gateway_timeout_secs() -> u64 {
    15
}

fn default_cleanup_interval_secs() -> u64 {
    DEFAULT_CLEANUP_INTERVAL_SECS
}

fn default_pending_timeout_secs() -> u64 {
    DEFAULT_PENDING_TIMEOUT_SECS
}

fn default_cleanup_grace_secs() -> u64 {
    DEFAULT_CLEANUP_GRACE_SECS
}

fn default_payment_flags_refresh_secs() -> u64 {
    DEFAULT_PAYMENT_FLAGS_REFRESH_SECS
}

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

    let builder = fmt().with_env_filter(EnvFilter::new(filter_directive));
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(err) = result {
        eprintln!("tracing already initialized: {}", err);
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. `config/default.toml`
/// 3. `config/{RUN_ENV}.toml`
/// 4. Environment variables (`APP__*`, nested with `__`)
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

    let config = Config::builder()
        .set_default("database_url", "sqlite://storefront.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", i64::from(DEFAULT_PORT))?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(
            Environment::with_prefix("APP")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    if config.get_string("jwt_secret").is_err() {
        error!("JWT secret is not configured. Set APP__JWT_SECRET to the identity provider's signing secret.");
        return Err(AppConfigError::Load(ConfigError::NotFound(
            "jwt_secret is required but not configured".into(),
        )));
    }

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}
