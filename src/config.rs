//! Configuration management for the exchange.
//! Supports environment variables and sane defaults for every external knob
//! named in the design doc (data directory, HTTP port, scheduler, data-fetch
//! timeout, and the out-of-core JWT secret).

use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub data_dir: String,
    pub http_port: u16,
    pub scheduler: SchedulerConfig,
    pub fetch_timeout_secs: u64,
    /// Carried for the out-of-core auth layer; never read by the core engine.
    pub jwt_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub period_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            period_secs: 60,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            http_port: 3001,
            scheduler: SchedulerConfig::default(),
            fetch_timeout_secs: 10,
            jwt_secret: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables with fallback to defaults.
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Ok(dir) = env::var("DATA_DIR") {
            config.data_dir = dir;
        }
        if let Ok(port) = env::var("HTTP_PORT") {
            config.http_port = port.parse().unwrap_or(config.http_port);
        }
        if let Ok(enabled) = env::var("SCHEDULER_ENABLED") {
            config.scheduler.enabled = enabled.parse().unwrap_or(config.scheduler.enabled);
        }
        if let Ok(period) = env::var("SCHEDULER_PERIOD_SECS") {
            config.scheduler.period_secs = period.parse().unwrap_or(config.scheduler.period_secs);
        }
        if let Ok(timeout) = env::var("FETCH_TIMEOUT_SECS") {
            config.fetch_timeout_secs = timeout.parse().unwrap_or(config.fetch_timeout_secs);
        }
        if let Ok(secret) = env::var("JWT_SECRET") {
            config.jwt_secret = Some(secret);
        }

        config
    }

    /// Path to the SQLite database file under `data_dir`.
    pub fn database_path(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.data_dir).join("exchange.db")
    }

    pub fn database_url(&self) -> String {
        format!("sqlite://{}", self.database_path().display())
    }
}
