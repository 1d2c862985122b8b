use rust_decimal::Decimal;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_lifetime_secs: u64,
    pub test_before_acquire: bool,
}

/// Money rules for escrows and withdrawals
#[derive(Debug, Clone)]
pub struct PaymentConfig {
    /// Platform commission taken from each escrow, e.g. 0.10
    pub commission_rate: Decimal,
    pub min_escrow_amount: Decimal,
    pub min_withdrawal_amount: Decimal,
    pub min_iban_length: usize,
    /// Lower-case ISO 4217 code; single currency throughout
    pub currency: String,
    /// Release from a PENDING escrow when the webhook confirmation was missed
    pub allow_unconfirmed_release: bool,
    pub gateway_timeout_secs: u64,
}

/// Which payment rail backs the gateway adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentMode {
    /// Fictitious payouts, no real money moves
    Simulated,
    Stripe,
}

impl PaymentMode {
    pub fn from_str(s: &str) -> Result<Self, String> {
        match s.to_lowercase().as_str() {
            "simulated" => Ok(PaymentMode::Simulated),
            "stripe" => Ok(PaymentMode::Stripe),
            _ => Err(format!("Invalid PAYMENT_MODE: {}. Must be one of: simulated, stripe", s)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMode::Simulated => "simulated",
            PaymentMode::Stripe => "stripe",
        }
    }
}

/// Payment provider configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub mode: PaymentMode,
    pub api_base: String,
    pub secret_key: Option<String>,
    pub webhook_secret: Option<String>,
    pub webhook_tolerance_secs: i64,
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub payment: PaymentConfig,
    pub gateway: GatewayConfig,
    pub log_level: String,
    pub environment: String,
    pub audit_log_dir: PathBuf,
    pub reconcile_interval_secs: u64,
    pub stale_pending_minutes: i64,
}

/// Read an optional env var and parse it, falling back to `default` when the
/// variable is unset. A set but unparsable value is an error.
fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T, String> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| format!("{} has an invalid value: {}", key, raw)),
        Err(_) => Ok(default),
    }
}

impl DatabaseConfig {
    /// Create database config from environment variables
    pub fn from_env() -> Result<Self, String> {
        let url = env::var("DATABASE_URL")
            .map_err(|_| "DATABASE_URL environment variable is required")?;

        let max_connections = env_parse("DATABASE_MAX_CONNECTIONS", 10u32)?;
        let acquire_timeout_secs = env_parse("DATABASE_ACQUIRE_TIMEOUT_SECS", 30u64)?;
        let idle_timeout_secs = env_parse("DATABASE_IDLE_TIMEOUT_SECS", 600u64)?; // 10 minutes
        let max_lifetime_secs = env_parse("DATABASE_MAX_LIFETIME_SECS", 1800u64)?; // 30 minutes
        let test_before_acquire = env_parse("DATABASE_TEST_BEFORE_ACQUIRE", true)?;

        if max_connections == 0 {
            return Err("DATABASE_MAX_CONNECTIONS must be greater than 0".to_string());
        }

        if acquire_timeout_secs == 0 {
            return Err("DATABASE_ACQUIRE_TIMEOUT_SECS must be greater than 0".to_string());
        }

        Ok(Self {
            url,
            max_connections,
            acquire_timeout_secs,
            idle_timeout_secs,
            max_lifetime_secs,
            test_before_acquire,
        })
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/ecodeli".to_string(),
            max_connections: 10,
            acquire_timeout_secs: 30,
            idle_timeout_secs: 600,
            max_lifetime_secs: 1800,
            test_before_acquire: true,
        }
    }
}

impl PaymentConfig {
    pub fn from_env() -> Result<Self, String> {
        let defaults = Self::default();

        let config = Self {
            commission_rate: env_parse("COMMISSION_RATE", defaults.commission_rate)?,
            min_escrow_amount: env_parse("MIN_ESCROW_AMOUNT", defaults.min_escrow_amount)?,
            min_withdrawal_amount: env_parse("MIN_WITHDRAWAL_AMOUNT", defaults.min_withdrawal_amount)?,
            min_iban_length: env_parse("MIN_IBAN_LENGTH", defaults.min_iban_length)?,
            currency: env::var("CURRENCY")
                .map(|c| c.trim().to_lowercase())
                .unwrap_or(defaults.currency),
            allow_unconfirmed_release: env_parse(
                "ALLOW_UNCONFIRMED_RELEASE",
                defaults.allow_unconfirmed_release,
            )?,
            gateway_timeout_secs: env_parse("GATEWAY_TIMEOUT_SECS", defaults.gateway_timeout_secs)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.commission_rate < Decimal::ZERO || self.commission_rate >= Decimal::ONE {
            return Err(format!(
                "COMMISSION_RATE must be in [0, 1), got {}",
                self.commission_rate
            ));
        }
        if self.min_escrow_amount <= Decimal::ZERO {
            return Err("MIN_ESCROW_AMOUNT must be greater than 0".to_string());
        }
        if self.min_withdrawal_amount <= Decimal::ZERO {
            return Err("MIN_WITHDRAWAL_AMOUNT must be greater than 0".to_string());
        }
        if self.currency.len() != 3 {
            return Err(format!("CURRENCY must be an ISO 4217 code, got {}", self.currency));
        }
        if self.gateway_timeout_secs == 0 {
            return Err("GATEWAY_TIMEOUT_SECS must be greater than 0".to_string());
        }
        Ok(())
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway_timeout_secs)
    }
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            commission_rate: Decimal::new(10, 2),
            min_escrow_amount: Decimal::new(100, 2),
            min_withdrawal_amount: Decimal::new(100, 2),
            min_iban_length: 15,
            currency: "eur".to_string(),
            allow_unconfirmed_release: true,
            gateway_timeout_secs: 15,
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, String> {
        let mode = PaymentMode::from_str(
            &env::var("PAYMENT_MODE").unwrap_or_else(|_| "simulated".to_string()),
        )?;

        let secret_key = env::var("STRIPE_SECRET_KEY").ok().filter(|k| !k.trim().is_empty());
        let webhook_secret = env::var("STRIPE_WEBHOOK_SECRET").ok().filter(|k| !k.trim().is_empty());

        if mode == PaymentMode::Stripe && secret_key.is_none() {
            return Err("STRIPE_SECRET_KEY is required when PAYMENT_MODE=stripe".to_string());
        }

        Ok(Self {
            mode,
            api_base: env::var("STRIPE_API_BASE")
                .unwrap_or_else(|_| "https://api.stripe.com".to_string()),
            secret_key,
            webhook_secret,
            webhook_tolerance_secs: env_parse("WEBHOOK_TOLERANCE_SECS", 300i64)?,
        })
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            mode: PaymentMode::Simulated,
            api_base: "https://api.stripe.com".to_string(),
            secret_key: None,
            webhook_secret: None,
            webhook_tolerance_secs: 300,
        }
    }
}

impl AppConfig {
    /// Create application config from environment variables
    pub fn from_env() -> Result<Self, String> {
        let database = DatabaseConfig::from_env()?;
        let payment = PaymentConfig::from_env()?;
        let gateway = GatewayConfig::from_env()?;

        let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        let audit_log_dir = PathBuf::from(
            env::var("AUDIT_LOG_DIR").unwrap_or_else(|_| "./logs".to_string()),
        );

        let reconcile_interval_secs = env_parse("RECONCILE_INTERVAL_SECS", 300u64)?;
        let stale_pending_minutes = env_parse("STALE_PENDING_MINUTES", 60i64)?;

        // Validate log level
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid LOG_LEVEL: {}. Must be one of: {:?}",
                log_level, valid_log_levels
            ));
        }

        // Validate environment
        let valid_environments = ["development", "staging", "production"];
        if !valid_environments.contains(&environment.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid ENVIRONMENT: {}. Must be one of: {:?}",
                environment, valid_environments
            ));
        }

        if environment.to_lowercase() == "production" && gateway.mode == PaymentMode::Simulated {
            return Err("PAYMENT_MODE=simulated is not allowed in production".to_string());
        }

        if stale_pending_minutes <= 0 {
            return Err("STALE_PENDING_MINUTES must be greater than 0".to_string());
        }

        Ok(Self {
            database,
            payment,
            gateway,
            log_level: log_level.to_lowercase(),
            environment: environment.to_lowercase(),
            audit_log_dir,
            reconcile_interval_secs,
            stale_pending_minutes,
        })
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    pub fn is_development(&self) -> bool {
        self.environment == "development"
    }

    pub fn database_url(&self) -> &str {
        &self.database.url
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            payment: PaymentConfig::default(),
            gateway: GatewayConfig::default(),
            log_level: "info".to_string(),
            environment: "development".to_string(),
            audit_log_dir: PathBuf::from("./logs"),
            reconcile_interval_secs: 300,
            stale_pending_minutes: 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_config_default() {
        let config = DatabaseConfig::default();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.acquire_timeout_secs, 30);
    }

    #[test]
    fn test_app_config_default() {
        let config = AppConfig::default();
        assert!(config.is_development());
        assert!(!config.is_production());
        assert_eq!(config.gateway.mode, PaymentMode::Simulated);
    }

    #[test]
    fn test_payment_config_defaults() {
        let config = PaymentConfig::default();
        assert_eq!(config.commission_rate, Decimal::new(10, 2));
        assert_eq!(config.min_escrow_amount, Decimal::ONE);
        assert_eq!(config.min_withdrawal_amount, Decimal::ONE);
        assert_eq!(config.currency, "eur");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_payment_config_rejects_bad_commission() {
        let config = PaymentConfig {
            commission_rate: Decimal::ONE,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = PaymentConfig {
            commission_rate: Decimal::new(-5, 2),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_payment_mode_parsing() {
        assert_eq!(PaymentMode::from_str("STRIPE").unwrap(), PaymentMode::Stripe);
        assert_eq!(PaymentMode::from_str("simulated").unwrap(), PaymentMode::Simulated);
        assert!(PaymentMode::from_str("paypal").is_err());
    }
}
