//! Configuration system for Keyforge.
//!
//! Configuration is loaded from multiple sources with the following precedence:
//! 1. Environment variables (highest priority)
//! 2. `config.toml` file
//! 3. Default values (lowest priority)
//!
//! # Environment Variables
//!
//! - `KEYFORGE_SERVER_HOST` - Server bind address
//! - `KEYFORGE_SERVER_PORT` - Server port
//! - `KEYFORGE_DATABASE_TYPE` - `sqlite` or `postgres`
//! - `KEYFORGE_DATABASE_URL` - Database connection URL (routed by scheme)
//! - `KEYFORGE_DATABASE_MAX_CONNECTIONS` - Pool size
//! - `KEYFORGE_SIGNING_SECRET` - Shared secret used to sign verification responses
//! - `KEYFORGE_ADMIN_API_KEY` - Key required on administrative routes
//! - `KEYFORGE_AUDIT_QUEUE_CAPACITY` - Pending audit entries before new ones are dropped
//! - `KEYFORGE_LISTING_DEFAULT_LIMIT` - Page size when a listing omits `limit`
//! - `KEYFORGE_LISTING_MAX_LIMIT` - Largest page size a listing may request
//! - `KEYFORGE_RATE_LIMIT_ENABLED` - Enable the verification rate limiter
//! - `KEYFORGE_RATE_LIMIT_VERIFY_RPM` - Verification requests per minute per client IP
//! - `KEYFORGE_RATE_LIMIT_BURST_SIZE` - Allowed burst above the steady rate
//! - `KEYFORGE_LOG_LEVEL` - Log level (trace, debug, info, warn, error)
//!
//! The signing secret is read once at startup. Rotating it requires a restart
//! and invalidates tags issued under the previous secret.

use config::Config;
use serde::Deserialize;
use std::env;
use std::sync::OnceLock;

use crate::errors::{ActivationError, ActivationResult};

/// Global configuration singleton.
static CONFIG: OnceLock<KeyforgeConfig> = OnceLock::new();

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KeyforgeConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub signing: SigningConfig,
    pub admin: AdminConfig,
    pub audit: AuditConfig,
    pub listing: ListingConfig,
    pub rate_limit: RateLimitConfig,
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host address to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database type: "sqlite" or "postgres"
    pub db_type: String,
    /// SQLite connection URL
    pub sqlite_url: String,
    /// PostgreSQL connection URL
    pub postgres_url: String,
    /// Maximum pooled connections
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            db_type: "sqlite".to_string(),
            sqlite_url: "sqlite://keyforge.db?mode=rwc".to_string(),
            postgres_url: "postgres://localhost/keyforge".to_string(),
            max_connections: 8,
        }
    }
}

/// Response signing configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SigningConfig {
    /// HMAC shared secret. Must be non-empty.
    pub secret: String,
}

/// Administrative boundary configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Value expected in the `X-API-Key` header. Empty disables admin routes.
    pub api_key: String,
}

/// Audit recorder configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Bounded queue size between request handlers and the audit writer
    pub queue_capacity: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
        }
    }
}

/// Listing pagination limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListingConfig {
    pub default_limit: u32,
    pub max_limit: u32,
}

impl Default for ListingConfig {
    fn default() -> Self {
        Self {
            default_limit: 20,
            max_limit: 100,
        }
    }
}

/// Rate limiting configuration for the verification endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Verification requests per minute per client IP
    pub verify_rpm: u64,
    /// Allowed burst above the steady rate
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            verify_rpm: 100,
            burst_size: 5,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

fn config_err(e: config::ConfigError) -> ActivationError {
    ActivationError::Config(e.to_string())
}

impl KeyforgeConfig {
    /// Load configuration from file and environment.
    ///
    /// Later sources override earlier ones:
    /// 1. Default values
    /// 2. `config.toml` file (optional)
    /// 3. Environment variables
    pub fn load() -> ActivationResult<Self> {
        let defaults = KeyforgeConfig::default();

        let builder = Config::builder()
            .set_default("server.host", defaults.server.host)
            .map_err(config_err)?
            .set_default("server.port", i64::from(defaults.server.port))
            .map_err(config_err)?
            .set_default("database.db_type", defaults.database.db_type)
            .map_err(config_err)?
            .set_default("database.sqlite_url", defaults.database.sqlite_url)
            .map_err(config_err)?
            .set_default("database.postgres_url", defaults.database.postgres_url)
            .map_err(config_err)?
            .set_default(
                "database.max_connections",
                i64::from(defaults.database.max_connections),
            )
            .map_err(config_err)?
            .set_default("signing.secret", "")
            .map_err(config_err)?
            .set_default("admin.api_key", "")
            .map_err(config_err)?
            .set_default("audit.queue_capacity", defaults.audit.queue_capacity as i64)
            .map_err(config_err)?
            .set_default("listing.default_limit", i64::from(defaults.listing.default_limit))
            .map_err(config_err)?
            .set_default("listing.max_limit", i64::from(defaults.listing.max_limit))
            .map_err(config_err)?
            .set_default("rate_limit.enabled", defaults.rate_limit.enabled)
            .map_err(config_err)?
            .set_default("rate_limit.verify_rpm", defaults.rate_limit.verify_rpm as i64)
            .map_err(config_err)?
            .set_default("rate_limit.burst_size", i64::from(defaults.rate_limit.burst_size))
            .map_err(config_err)?
            .set_default("logging.level", defaults.logging.level)
            .map_err(config_err)?
            // Load from config.toml (optional)
            .add_source(config::File::with_name("config").required(false))
            // Override with environment variables
            .set_override_option("server.host", env::var("KEYFORGE_SERVER_HOST").ok())
            .map_err(config_err)?
            .set_override_option(
                "server.port",
                env::var("KEYFORGE_SERVER_PORT")
                    .ok()
                    .and_then(|v| v.parse::<i64>().ok()),
            )
            .map_err(config_err)?
            .set_override_option("database.db_type", env::var("KEYFORGE_DATABASE_TYPE").ok())
            .map_err(config_err)?
            .set_override_option(
                "database.sqlite_url",
                env::var("KEYFORGE_DATABASE_URL")
                    .ok()
                    .filter(|url| url.starts_with("sqlite")),
            )
            .map_err(config_err)?
            .set_override_option(
                "database.postgres_url",
                env::var("KEYFORGE_DATABASE_URL")
                    .ok()
                    .filter(|url| url.starts_with("postgres")),
            )
            .map_err(config_err)?
            .set_override_option(
                "database.max_connections",
                env::var("KEYFORGE_DATABASE_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|v| v.parse::<i64>().ok()),
            )
            .map_err(config_err)?
            .set_override_option("signing.secret", env::var("KEYFORGE_SIGNING_SECRET").ok())
            .map_err(config_err)?
            .set_override_option("admin.api_key", env::var("KEYFORGE_ADMIN_API_KEY").ok())
            .map_err(config_err)?
            .set_override_option(
                "audit.queue_capacity",
                env::var("KEYFORGE_AUDIT_QUEUE_CAPACITY")
                    .ok()
                    .and_then(|v| v.parse::<i64>().ok()),
            )
            .map_err(config_err)?
            .set_override_option(
                "listing.default_limit",
                env::var("KEYFORGE_LISTING_DEFAULT_LIMIT")
                    .ok()
                    .and_then(|v| v.parse::<i64>().ok()),
            )
            .map_err(config_err)?
            .set_override_option(
                "listing.max_limit",
                env::var("KEYFORGE_LISTING_MAX_LIMIT")
                    .ok()
                    .and_then(|v| v.parse::<i64>().ok()),
            )
            .map_err(config_err)?
            .set_override_option(
                "rate_limit.verify_rpm",
                env::var("KEYFORGE_RATE_LIMIT_VERIFY_RPM")
                    .ok()
                    .and_then(|v| v.parse::<i64>().ok()),
            )
            .map_err(config_err)?
            .set_override_option(
                "rate_limit.burst_size",
                env::var("KEYFORGE_RATE_LIMIT_BURST_SIZE")
                    .ok()
                    .and_then(|v| v.parse::<i64>().ok()),
            )
            .map_err(config_err)?
            .set_override_option(
                "rate_limit.enabled",
                env::var("KEYFORGE_RATE_LIMIT_ENABLED")
                    .ok()
                    .and_then(|v| v.parse::<bool>().ok()),
            )
            .map_err(config_err)?
            .set_override_option("logging.level", env::var("KEYFORGE_LOG_LEVEL").ok())
            .map_err(config_err)?;

        let settings = builder
            .build()
            .map_err(|e| ActivationError::Config(format!("failed to build config: {e}")))?;

        settings
            .try_deserialize()
            .map_err(|e| ActivationError::Config(format!("failed to deserialize config: {e}")))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ActivationResult<()> {
        if self.server.port == 0 {
            return Err(ActivationError::Config(
                "server.port must be greater than 0".to_string(),
            ));
        }

        match self.database.db_type.as_str() {
            "sqlite" | "postgres" => {}
            other => {
                return Err(ActivationError::Config(format!(
                    "database.db_type must be 'sqlite' or 'postgres', got '{other}'"
                )));
            }
        }

        if self.database.max_connections == 0 {
            return Err(ActivationError::Config(
                "database.max_connections must be greater than 0".to_string(),
            ));
        }

        if self.signing.secret.trim().is_empty() {
            return Err(ActivationError::Config(
                "signing.secret is required (set KEYFORGE_SIGNING_SECRET)".to_string(),
            ));
        }

        if self.audit.queue_capacity == 0 {
            return Err(ActivationError::Config(
                "audit.queue_capacity must be greater than 0".to_string(),
            ));
        }

        if self.listing.default_limit == 0 || self.listing.default_limit > self.listing.max_limit
        {
            return Err(ActivationError::Config(format!(
                "listing.default_limit must be between 1 and listing.max_limit ({})",
                self.listing.max_limit
            )));
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(ActivationError::Config(format!(
                    "logging.level must be one of: trace, debug, info, warn, error. Got '{other}'"
                )));
            }
        }

        Ok(())
    }
}

/// Get the global configuration.
///
/// Loads and validates on first access, then returns the cached value.
pub fn get_config() -> ActivationResult<&'static KeyforgeConfig> {
    if let Some(config) = CONFIG.get() {
        return Ok(config);
    }

    let config = KeyforgeConfig::load()?;
    config.validate()?;

    // Another thread may have won the race; either value is equivalent.
    let _ = CONFIG.set(config);

    CONFIG
        .get()
        .ok_or_else(|| ActivationError::Config("configuration was not initialised".to_string()))
}

/// Initialize configuration explicitly.
///
/// Call this early in the binary to surface configuration errors at startup.
pub fn init_config() -> ActivationResult<&'static KeyforgeConfig> {
    get_config()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> KeyforgeConfig {
        KeyforgeConfig {
            signing: SigningConfig {
                secret: "s3cret".to_string(),
            },
            ..KeyforgeConfig::default()
        }
    }

    #[test]
    fn defaults_are_valid_once_secret_is_set() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn missing_secret_is_rejected() {
        let err = KeyforgeConfig::default().validate().unwrap_err();
        assert!(err.to_string().contains("signing.secret"));
    }

    #[test]
    fn unknown_db_type_is_rejected() {
        let mut config = valid_config();
        config.database.db_type = "mysql".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_limit_above_max_is_rejected() {
        let mut config = valid_config();
        config.listing.default_limit = 500;
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_log_level_is_rejected() {
        let mut config = valid_config();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }
}
