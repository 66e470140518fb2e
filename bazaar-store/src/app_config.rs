use bazaar_core::CoreError;
use bazaar_wallet::{PayoutFrequency, PayoutSchedule, WeeklyWindow};
use chrono::Weekday;
use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub kafka: KafkaConfig,
    pub auth: AuthConfig,
    pub payouts: PayoutsConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub jwt_expiration_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

/// Absent url: rate limiting and the sweep lease are skipped.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct RedisConfig {
    pub url: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct KafkaConfig {
    pub brokers: Option<String>,
}

/// Platform default payout window. Vendors may override it per wallet.
#[derive(Debug, Deserialize, Clone)]
pub struct PayoutsConfig {
    pub default_timezone: String,
    pub cutoff_weekday: String,
    pub cutoff_hour: u32,
    pub payout_weekday: String,
    pub payout_hour: u32,
    pub frequency: PayoutFrequency,
    pub sweep_interval_seconds: u64,
}

impl PayoutsConfig {
    pub fn schedule(&self) -> Result<PayoutSchedule, CoreError> {
        PayoutSchedule::new(
            self.frequency,
            WeeklyWindow::new(parse_weekday(&self.cutoff_weekday)?, self.cutoff_hour)?,
            WeeklyWindow::new(parse_weekday(&self.payout_weekday)?, self.payout_hour)?,
            &self.default_timezone,
        )
    }
}

fn parse_weekday(raw: &str) -> Result<Weekday, CoreError> {
    raw.parse::<Weekday>()
        .map_err(|_| CoreError::Invalid(format!("unknown weekday: {}", raw)))
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    pub requests: i64,
    pub window_seconds: i64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests: 100,
            window_seconds: 60,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            // Optional per-environment overrides
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // Not checked in
            .add_source(config::File::with_name("config/local").required(false))
            // e.g. `BAZAAR__DATABASE__URL`
            .add_source(config::Environment::with_prefix("BAZAAR").prefix_separator("__").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}
