//! Configuration module

use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::error::SyncError;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: Url,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_expiry_margin_secs")]
    pub expiry_margin_secs: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_max_buffered_records")]
    pub max_buffered_records: usize,
    #[serde(default = "default_horizon_days")]
    pub default_horizon_days: i64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            username: None,
            password: None,
            timeout_secs: default_timeout_secs(),
            expiry_margin_secs: default_expiry_margin_secs(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            max_buffered_records: default_max_buffered_records(),
            default_horizon_days: default_horizon_days(),
            retry_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_endpoint() -> Url {
    Url::parse("https://api.eonnext-kraken.energy/v1/graphql/").expect("valid default endpoint")
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_expiry_margin_secs() -> i64 {
    60
}

fn default_page_size() -> usize {
    100
}

fn default_max_buffered_records() -> usize {
    5000
}

fn default_horizon_days() -> i64 {
    30
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    8000
}

fn default_db_path() -> String {
    "./eon-data.db".to_string()
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn expiry_margin(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.expiry_margin_secs)
    }

    /// Username/password, falling back to the `EON_USERNAME`/`EON_PASSWORD` variables
    pub fn credentials(&self) -> Result<(String, String), SyncError> {
        let username = self
            .username
            .clone()
            .or_else(|| std::env::var("EON_USERNAME").ok())
            .filter(|u| !u.is_empty());
        let password = self
            .password
            .clone()
            .or_else(|| std::env::var("EON_PASSWORD").ok())
            .filter(|p| !p.is_empty());

        match (username, password) {
            (Some(u), Some(p)) => Ok((u, p)),
            _ => Err(SyncError::Config(
                "Credentials not provided. Set EON_USERNAME and EON_PASSWORD or \
                 EONSYNC__API__USERNAME and EONSYNC__API__PASSWORD"
                    .to_string(),
            )),
        }
    }
}

impl Config {
    /// Load from `config/default`, an optional explicit file, then `EONSYNC__*` env vars
    pub fn load(path: Option<&str>) -> Result<Self, SyncError> {
        let mut builder = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false));

        let explicit = path
            .map(str::to_string)
            .or_else(|| std::env::var("EON_SYNC_CONFIG").ok());
        if let Some(file) = explicit {
            builder = builder.add_source(config::File::with_name(&file).required(true));
        }

        let settings = builder
            .add_source(config::Environment::with_prefix("EONSYNC").separator("__"))
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.sync.page_size == 0 || self.sync.page_size > 1000 {
            return Err(SyncError::Config(format!(
                "sync.page_size must be within 1..=1000, got {}",
                self.sync.page_size
            )));
        }
        if self.sync.retry_attempts == 0 {
            return Err(SyncError::Config(
                "sync.retry_attempts must be at least 1".to_string(),
            ));
        }
        if self.sync.max_buffered_records == 0 {
            return Err(SyncError::Config(
                "sync.max_buffered_records must be at least 1".to_string(),
            ));
        }
        if self.api.expiry_margin_secs < 0 {
            return Err(SyncError::Config(
                "api.expiry_margin_secs must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.sync.page_size, 100);
        assert_eq!(config.sync.retry_attempts, 3);
        assert_eq!(config.api.timeout(), Duration::from_secs(30));
        assert_eq!(config.api.expiry_margin(), chrono::Duration::seconds(60));
        assert_eq!(config.database.path, "./eon-data.db");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_oversized_page() {
        let mut config = Config::default();
        config.sync.page_size = 5000;
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(
                "[sync]\npage_size = 50\n[database]\npath = \"/tmp/x.db\"\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap();
        let config: Config = settings.try_deserialize().unwrap();
        assert_eq!(config.sync.page_size, 50);
        assert_eq!(config.sync.max_buffered_records, 5000);
        assert_eq!(config.database.path, "/tmp/x.db");
        assert_eq!(config.api.endpoint.host_str(), Some("api.eonnext-kraken.energy"));
    }
}
