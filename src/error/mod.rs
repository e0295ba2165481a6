//! Error handling module

use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Authentication rejected: {0}")]
    Authentication(String),

    #[error("Credential expired or rejected mid-fetch")]
    AuthenticationExpired,

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Fetch failed after {attempts} attempt(s): {source}")]
    Fetch {
        attempts: u32,
        #[source]
        source: Box<SyncError>,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Validation error: {0}")]
    Validation(#[from] RecordRejection),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl SyncError {
    /// Whether another attempt of the same call may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transient(_))
    }

    /// Classify a transport-level reqwest failure
    pub fn from_transport(context: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            return SyncError::Transient(format!("{}: {}", context, err));
        }
        if let Some(status) = err.status() {
            if status.is_server_error() || status.as_u16() == 429 {
                return SyncError::Transient(format!("{}: {}", context, err));
            }
        }
        if err.is_decode() {
            return SyncError::Remote(format!("{} parse failed: {}", context, err));
        }
        SyncError::Transient(format!("{}: {}", context, err))
    }
}

impl From<config::ConfigError> for SyncError {
    fn from(err: config::ConfigError) -> Self {
        SyncError::Config(err.to_string())
    }
}

/// A single record refused by validation; never aborts its batch
#[derive(Error, Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[error("record {interval_start}: {reason}")]
pub struct RecordRejection {
    pub interval_start: String,
    pub reason: String,
}

impl RecordRejection {
    pub fn new(interval_start: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            interval_start: interval_start.into(),
            reason: reason.into(),
        }
    }

    pub fn at(interval_start: DateTime<Utc>, reason: impl Into<String>) -> Self {
        Self::new(interval_start.to_rfc3339(), reason)
    }
}
