//! Application configuration module
//! Handles environment variable loading, configuration validation, and application settings

use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    /// `None` when the service runs with `SKIP_EXTERNALS=true`
    pub database: Option<DatabaseConfig>,
    pub logging: LoggingConfig,
    pub mpesa: MpesaConfig,
    pub settlement: SettlementConfig,
    pub workers: WorkerConfig,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout: u64,   // seconds
    pub idle_timeout: Option<u64>, // seconds
    pub run_migrations: bool,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log format options
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Plain,
}

/// Mobile-money gateway credentials and endpoints.
///
/// Loaded once at start-up and handed to the gateway client.
#[derive(Clone)]
pub struct MpesaConfig {
    pub base_url: String,
    pub consumer_key: String,
    pub consumer_secret: String,
    /// Paybill / till number used for collections and as B2C party A
    pub shortcode: String,
    pub passkey: String,
    pub initiator_name: String,
    pub security_credential: String,
    /// Public base URL the gateway posts results to
    pub callback_base_url: String,
    /// Shared secret appended to callback URLs as `?token=`
    pub callback_token: Option<String>,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub token_safety_margin: Duration,
    pub currency: String,
    pub country_code: String,
    pub b2c_command_id: String,
}

/// Money movement rules and deadlines
#[derive(Debug, Clone)]
pub struct SettlementConfig {
    /// Platform share of a booking total, in percent
    pub commission_percent: Decimal,
    /// How long a collection may sit in `awaiting_callback`
    pub collection_deadline: Duration,
    /// How long a disbursement may sit in `awaiting_callback`
    pub disbursement_deadline: Duration,
    /// Length cap for a disbursement retry chain, first attempt included
    pub max_disbursement_attempts: u32,
}

/// Background worker tuning
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub sweep_interval: Duration,
    pub sweep_batch_size: i64,
    pub webhook_retry_interval: Duration,
    pub webhook_max_retries: i32,
    pub notification_workers: usize,
    pub notification_queue_capacity: usize,
    pub skip_externals: bool,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenv::dotenv().ok();

        let workers = WorkerConfig::from_env()?;
        let database = if workers.skip_externals {
            None
        } else {
            Some(DatabaseConfig::from_env()?)
        };

        Ok(AppConfig {
            server: ServerConfig::from_env()?,
            database,
            logging: LoggingConfig::from_env()?,
            mpesa: MpesaConfig::from_env()?,
            settlement: SettlementConfig::from_env()?,
            workers,
        })
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        if let Some(database) = &self.database {
            database.validate()?;
        }
        self.logging.validate()?;
        if !self.workers.skip_externals {
            self.mpesa.validate()?;
        }
        self.settlement.validate()?;
        self.workers.validate()?;

        Ok(())
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(ServerConfig {
            host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: parse_var("SERVER_PORT", 8000u16)?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidValue(
                "SERVER_PORT cannot be 0".to_string(),
            ));
        }

        if self.host.is_empty() {
            return Err(ConfigError::InvalidValue(
                "SERVER_HOST cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(DatabaseConfig {
            url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::MissingVariable("DATABASE_URL".to_string()))?,
            max_connections: parse_var("DB_MAX_CONNECTIONS", 20)?,
            min_connections: parse_var("DB_MIN_CONNECTIONS", 5)?,
            connection_timeout: parse_var("DB_CONNECTION_TIMEOUT", 30)?,
            idle_timeout: env::var("DB_IDLE_TIMEOUT")
                .ok()
                .and_then(|val| val.parse().ok()),
            run_migrations: parse_var("DB_RUN_MIGRATIONS", true)?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::InvalidValue("DATABASE_URL".to_string()));
        }

        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue("DB_MAX_CONNECTIONS".to_string()));
        }

        if self.min_connections > self.max_connections {
            return Err(ConfigError::InvalidValue(
                "DB_MIN_CONNECTIONS must be <= DB_MAX_CONNECTIONS".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            format: LogFormat::Plain,
        }
    }
}

impl LoggingConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "plain".to_string())
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Plain,
            },
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];
        if !valid_levels.contains(&self.level.to_uppercase().as_str()) {
            return Err(ConfigError::InvalidValue("LOG_LEVEL".to_string()));
        }

        Ok(())
    }
}

impl std::fmt::Debug for MpesaConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MpesaConfig")
            .field("base_url", &self.base_url)
            .field("shortcode", &self.shortcode)
            .field("initiator_name", &self.initiator_name)
            .field("callback_base_url", &self.callback_base_url)
            .field("request_timeout", &self.request_timeout)
            .field("max_retries", &self.max_retries)
            .field("currency", &self.currency)
            .finish_non_exhaustive()
    }
}

impl Default for MpesaConfig {
    fn default() -> Self {
        Self {
            base_url: "https://sandbox.safaricom.co.ke".to_string(),
            consumer_key: String::new(),
            consumer_secret: String::new(),
            shortcode: String::new(),
            passkey: String::new(),
            initiator_name: String::new(),
            security_credential: String::new(),
            callback_base_url: "http://127.0.0.1:8000".to_string(),
            callback_token: None,
            request_timeout: Duration::from_secs(30),
            max_retries: 3,
            token_safety_margin: Duration::from_secs(60),
            currency: "KES".to_string(),
            country_code: "254".to_string(),
            b2c_command_id: "BusinessPayment".to_string(),
        }
    }
}

impl MpesaConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(MpesaConfig {
            base_url: env::var("MPESA_BASE_URL").unwrap_or(defaults.base_url),
            consumer_key: env::var("MPESA_CONSUMER_KEY").unwrap_or_default(),
            consumer_secret: env::var("MPESA_CONSUMER_SECRET").unwrap_or_default(),
            shortcode: env::var("MPESA_SHORTCODE").unwrap_or_default(),
            passkey: env::var("MPESA_PASSKEY").unwrap_or_default(),
            initiator_name: env::var("MPESA_INITIATOR_NAME").unwrap_or_default(),
            security_credential: env::var("MPESA_SECURITY_CREDENTIAL").unwrap_or_default(),
            callback_base_url: env::var("MPESA_CALLBACK_BASE_URL")
                .unwrap_or(defaults.callback_base_url),
            callback_token: env::var("MPESA_CALLBACK_TOKEN")
                .ok()
                .filter(|token| !token.is_empty()),
            request_timeout: Duration::from_secs(parse_var("MPESA_TIMEOUT_SECS", 30)?),
            max_retries: parse_var("MPESA_MAX_RETRIES", defaults.max_retries)?,
            token_safety_margin: Duration::from_secs(parse_var(
                "MPESA_TOKEN_SAFETY_MARGIN_SECS",
                60,
            )?),
            currency: env::var("MPESA_CURRENCY").unwrap_or(defaults.currency),
            country_code: env::var("MPESA_COUNTRY_CODE").unwrap_or(defaults.country_code),
            b2c_command_id: env::var("MPESA_B2C_COMMAND_ID").unwrap_or(defaults.b2c_command_id),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("MPESA_CONSUMER_KEY", &self.consumer_key),
            ("MPESA_CONSUMER_SECRET", &self.consumer_secret),
            ("MPESA_SHORTCODE", &self.shortcode),
            ("MPESA_PASSKEY", &self.passkey),
            ("MPESA_INITIATOR_NAME", &self.initiator_name),
            ("MPESA_SECURITY_CREDENTIAL", &self.security_credential),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingVariable(name.to_string()));
            }
        }

        for (name, url) in [
            ("MPESA_BASE_URL", &self.base_url),
            ("MPESA_CALLBACK_BASE_URL", &self.callback_base_url),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::InvalidValue(format!(
                    "{} must be a valid URL",
                    name
                )));
            }
        }

        if self.request_timeout.is_zero() {
            return Err(ConfigError::InvalidValue("MPESA_TIMEOUT_SECS".to_string()));
        }

        Ok(())
    }

    /// Full callback URL for a webhook route, with the shared token if configured.
    pub fn callback_url(&self, path: &str) -> String {
        let base = self.callback_base_url.trim_end_matches('/');
        match &self.callback_token {
            Some(token) => format!("{}{}?token={}", base, path, token),
            None => format!("{}{}", base, path),
        }
    }
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            commission_percent: Decimal::TEN,
            collection_deadline: Duration::from_secs(300),
            disbursement_deadline: Duration::from_secs(1800),
            max_disbursement_attempts: 3,
        }
    }
}

impl SettlementConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let commission_percent = match env::var("SETTLEMENT_COMMISSION_PERCENT") {
            Ok(raw) => Decimal::from_str(raw.trim()).map_err(|_| {
                ConfigError::InvalidValue("SETTLEMENT_COMMISSION_PERCENT".to_string())
            })?,
            Err(_) => defaults.commission_percent,
        };

        Ok(SettlementConfig {
            commission_percent,
            collection_deadline: Duration::from_secs(parse_var(
                "SETTLEMENT_COLLECTION_DEADLINE_SECS",
                defaults.collection_deadline.as_secs(),
            )?),
            disbursement_deadline: Duration::from_secs(parse_var(
                "SETTLEMENT_DISBURSEMENT_DEADLINE_SECS",
                defaults.disbursement_deadline.as_secs(),
            )?),
            max_disbursement_attempts: parse_var(
                "SETTLEMENT_MAX_DISBURSEMENT_ATTEMPTS",
                defaults.max_disbursement_attempts,
            )?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.commission_percent < Decimal::ZERO || self.commission_percent > Decimal::ONE_HUNDRED
        {
            return Err(ConfigError::ValidationFailed(
                "SETTLEMENT_COMMISSION_PERCENT must be between 0 and 100".to_string(),
            ));
        }

        if self.max_disbursement_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "SETTLEMENT_MAX_DISBURSEMENT_ATTEMPTS must be at least 1".to_string(),
            ));
        }

        if self.collection_deadline.is_zero() || self.disbursement_deadline.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "settlement deadlines must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            sweep_batch_size: 100,
            webhook_retry_interval: Duration::from_secs(30),
            webhook_max_retries: 5,
            notification_workers: 4,
            notification_queue_capacity: 1024,
            skip_externals: false,
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(WorkerConfig {
            sweep_interval: Duration::from_secs(parse_var(
                "SWEEP_INTERVAL_SECS",
                defaults.sweep_interval.as_secs(),
            )?),
            sweep_batch_size: parse_var("SWEEP_BATCH_SIZE", defaults.sweep_batch_size)?,
            webhook_retry_interval: Duration::from_secs(parse_var(
                "WEBHOOK_RETRY_INTERVAL_SECS",
                defaults.webhook_retry_interval.as_secs(),
            )?),
            webhook_max_retries: parse_var("WEBHOOK_MAX_RETRIES", defaults.webhook_max_retries)?,
            notification_workers: parse_var(
                "NOTIFICATION_WORKERS",
                defaults.notification_workers,
            )?,
            notification_queue_capacity: parse_var(
                "NOTIFICATION_QUEUE_CAPACITY",
                defaults.notification_queue_capacity,
            )?,
            skip_externals: env::var("SKIP_EXTERNALS")
                .unwrap_or_else(|_| "false".to_string())
                .to_lowercase()
                == "true",
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.notification_workers == 0 {
            return Err(ConfigError::InvalidValue(
                "NOTIFICATION_WORKERS must be at least 1".to_string(),
            ));
        }
        if self.notification_queue_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "NOTIFICATION_QUEUE_CAPACITY must be at least 1".to_string(),
            ));
        }
        if self.sweep_batch_size <= 0 {
            return Err(ConfigError::InvalidValue("SWEEP_BATCH_SIZE".to_string()));
        }
        Ok(())
    }
}

/// Read `name` from the environment, falling back to `default` when unset.
fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(name.to_string())),
        Err(_) => Ok(default),
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),

    #[error("Invalid value for configuration: {0}")]
    InvalidValue(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}

impl From<ConfigError> for crate::error::AppError {
    fn from(err: ConfigError) -> Self {
        use crate::error::{AppError, AppErrorKind, InfrastructureError};

        AppError::new(AppErrorKind::Infrastructure(
            InfrastructureError::Configuration {
                message: err.to_string(),
            },
        ))
    }
}
