//! E.ON Next metering API integration
//!
//! - `operations`: typed GraphQL request builders
//! - `client`: reqwest transport implementing [`MeteringApi`]

pub mod client;
pub mod operations;

pub use client::EonClient;
pub use operations::MeterConsumption;

use async_trait::async_trait;

use crate::error::SyncError;
use crate::models::{ConsumptionPage, Credential, Meter};

/// Remote metering service seam
#[async_trait]
pub trait MeteringApi: Send + Sync {
    /// Exchange account credentials for a short-lived token
    async fn authenticate(&self, username: &str, password: &str) -> Result<Credential, SyncError>;

    async fn account_numbers(&self, credential: &Credential) -> Result<Vec<String>, SyncError>;

    async fn meters(
        &self,
        credential: &Credential,
        account_number: &str,
    ) -> Result<Vec<Meter>, SyncError>;

    /// Fetch a single page of readings
    async fn consumption_page(
        &self,
        credential: &Credential,
        request: &MeterConsumption,
    ) -> Result<ConsumptionPage, SyncError>;
}

/// List every meter on the first account visible to the credential
pub async fn list_meters(
    api: &dyn MeteringApi,
    credential: &Credential,
) -> Result<Vec<Meter>, SyncError> {
    let accounts = api.account_numbers(credential).await?;
    let account_number = accounts
        .first()
        .ok_or_else(|| SyncError::Remote("No accounts found".to_string()))?;

    tracing::info!("[Eon] Using account: {}", account_number);
    api.meters(credential, account_number).await
}

/// Pick the meter to sync: by serial when given, else the only one
pub async fn discover_meter(
    api: &dyn MeteringApi,
    credential: &Credential,
    serial: Option<&str>,
) -> Result<Meter, SyncError> {
    let meters = list_meters(api, credential).await?;
    select_meter(meters, serial)
}

fn select_meter(meters: Vec<Meter>, serial: Option<&str>) -> Result<Meter, SyncError> {
    if meters.is_empty() {
        return Err(SyncError::Remote("No meters found".to_string()));
    }

    if let Some(serial) = serial {
        return meters
            .into_iter()
            .find(|m| m.serial == serial)
            .ok_or_else(|| SyncError::Config(format!("Meter with serial {} not found", serial)));
    }

    if meters.len() == 1 {
        let meter = meters.into_iter().next().ok_or_else(|| {
            SyncError::Remote("No meters found".to_string())
        })?;
        tracing::info!("[Eon] Auto-selected meter: {} ({})", meter.serial, meter.kind);
        return Ok(meter);
    }

    let available = meters
        .iter()
        .map(|m| format!("{} ({})", m.serial, m.kind))
        .collect::<Vec<_>>()
        .join(", ");
    Err(SyncError::Config(format!(
        "Multiple meters found, choose one with --meter: {}",
        available
    )))
}
