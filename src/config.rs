use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

fn env_string(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub database_url: String,
    pub db_pool_size: u32,
    pub telemetry_enabled: bool,
    pub ingestion: IngestionConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone)]
pub struct IngestionConfig {
    pub enabled: bool,
    pub generator_url: String,
    pub poll_interval_ms: u64,
    pub timeout_ms: u64,
    /// Reserved: the client never retries within a tick.
    pub max_retries: u32,
    pub startup_delay_ms: u64,
    pub readiness_check: bool,
}

impl IngestionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub cache_ttl_ms: u64,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub max_retries: u32,
    pub queue_capacity: usize,
}

impl StorageConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

impl AggregatorConfig {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let database_url = env::var("DATABASE_URL")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .context("DATABASE_URL is required")?;
        let db_pool_size = env_parse("DB_POOL_SIZE", 10u32);

        let telemetry_enabled = env_bool("TELEMETRY_ENABLED", true);

        let ingestion = IngestionConfig {
            enabled: env_bool("TELEMETRY_INGESTION_ENABLED", true),
            generator_url: env_string("TELEMETRY_GENERATOR_URL", "http://localhost:9001")
                .trim_end_matches('/')
                .to_string(),
            poll_interval_ms: env_parse("TELEMETRY_POLL_INTERVAL_MS", 1_000),
            timeout_ms: env_parse("TELEMETRY_TIMEOUT_MS", 5_000),
            max_retries: env_parse("TELEMETRY_MAX_RETRIES", 3u32),
            startup_delay_ms: env_parse("TELEMETRY_STARTUP_DELAY_MS", 2_000),
            readiness_check: env_bool("TELEMETRY_READINESS_CHECK", true),
        };

        let storage = StorageConfig {
            cache_ttl_ms: env_parse("TELEMETRY_CACHE_TTL_MS", 300_000),
            batch_size: env_parse("TELEMETRY_BATCH_SIZE", 100usize),
            flush_interval_ms: env_parse("TELEMETRY_FLUSH_INTERVAL_MS", 30_000),
            max_retries: env_parse("TELEMETRY_STORAGE_MAX_RETRIES", 3u32),
            queue_capacity: env_parse("TELEMETRY_QUEUE_CAPACITY", 100usize),
        };

        Ok(Self {
            database_url,
            db_pool_size,
            telemetry_enabled,
            ingestion,
            storage,
        })
    }
}
