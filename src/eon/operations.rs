//! Typed GraphQL operations against the Kraken API
//!
//! One builder per operation. Each serializes as its own `variables` object and
//! flattens the nested response into the crate's models.

#[cfg(test)]
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncError;
use crate::models::{
    format_instant, ConsumptionPage, ConsumptionRecord, Meter, MeterKind, SyncWindow,
};

/// A named GraphQL document with typed variables and a flattened output
pub trait Operation: Serialize + Send + Sync {
    const NAME: &'static str;
    const QUERY: &'static str;

    type Data: DeserializeOwned;
    type Output;

    fn extract(&self, data: Self::Data) -> Result<Self::Output, SyncError>;
}

#[derive(Debug, Serialize)]
pub struct GraphQlRequest<'a, O: Serialize> {
    #[serde(rename = "operationName")]
    pub operation_name: &'static str,
    pub query: &'static str,
    pub variables: &'a O,
}

impl<'a, O: Operation> GraphQlRequest<'a, O> {
    pub fn new(operation: &'a O) -> Self {
        Self {
            operation_name: O::NAME,
            query: O::QUERY,
            variables: operation,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct GraphQlResponse<D> {
    pub data: Option<D>,
    #[serde(default)]
    pub errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
pub struct GraphQlError {
    pub message: String,
    #[serde(default)]
    pub extensions: Option<ErrorExtensions>,
}

#[derive(Debug, Deserialize)]
pub struct ErrorExtensions {
    #[serde(rename = "errorCode")]
    pub error_code: Option<String>,
}

/// Kraken error codes meaning the presented token is no longer accepted
pub const AUTH_EXPIRED_CODES: &[&str] = &["KT-CT-1111", "KT-CT-1124", "KT-CT-1143"];

impl GraphQlError {
    pub fn is_auth_expired(&self) -> bool {
        self.extensions
            .as_ref()
            .and_then(|e| e.error_code.as_deref())
            .map(|code| AUTH_EXPIRED_CODES.contains(&code))
            .unwrap_or(false)
    }
}

pub fn join_messages(errors: &[GraphQlError]) -> String {
    errors
        .iter()
        .map(|e| e.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

// ============================================================================
// ObtainToken
// ============================================================================

#[derive(Serialize)]
pub struct ObtainToken {
    input: TokenInput,
}

#[derive(Serialize)]
struct TokenInput {
    email: String,
    password: String,
}

impl ObtainToken {
    pub fn new(email: &str, password: &str) -> Self {
        Self {
            input: TokenInput {
                email: email.to_string(),
                password: password.to_string(),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ObtainTokenData {
    #[serde(rename = "obtainKrakenToken")]
    obtain_kraken_token: Option<TokenResult>,
}

#[derive(Debug, Deserialize)]
pub struct TokenResult {
    pub token: String,
    #[serde(default)]
    pub payload: Option<Value>,
}

impl Operation for ObtainToken {
    const NAME: &'static str = "ObtainToken";
    const QUERY: &'static str = r#"
mutation ObtainToken($input: ObtainJSONWebTokenInput!) {
  obtainKrakenToken(input: $input) {
    token
    payload
  }
}"#;

    type Data = ObtainTokenData;
    type Output = TokenResult;

    fn extract(&self, data: Self::Data) -> Result<Self::Output, SyncError> {
        data.obtain_kraken_token
            .ok_or_else(|| SyncError::Authentication("No token in response".to_string()))
    }
}

// ============================================================================
// AccountNumbers
// ============================================================================

#[derive(Debug, Serialize)]
pub struct AccountNumbers {}

#[derive(Debug, Deserialize)]
pub struct AccountNumbersData {
    viewer: Option<Viewer>,
}

#[derive(Debug, Deserialize)]
struct Viewer {
    #[serde(default)]
    accounts: Vec<AccountRef>,
}

#[derive(Debug, Deserialize)]
struct AccountRef {
    number: String,
}

impl Operation for AccountNumbers {
    const NAME: &'static str = "AccountNumbers";
    const QUERY: &'static str = r#"
query AccountNumbers {
  viewer {
    accounts {
      number
    }
  }
}"#;

    type Data = AccountNumbersData;
    type Output = Vec<String>;

    fn extract(&self, data: Self::Data) -> Result<Self::Output, SyncError> {
        Ok(data
            .viewer
            .map(|v| v.accounts.into_iter().map(|a| a.number).collect())
            .unwrap_or_default())
    }
}

// ============================================================================
// AccountMeters
// ============================================================================

#[derive(Debug, Serialize)]
pub struct AccountMeters {
    #[serde(rename = "accountNumber")]
    account_number: String,
}

impl AccountMeters {
    pub fn new(account_number: &str) -> Self {
        Self {
            account_number: account_number.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AccountMetersData {
    account: Option<AccountProperties>,
}

#[derive(Debug, Deserialize)]
struct AccountProperties {
    #[serde(default)]
    properties: Vec<Property>,
}

#[derive(Debug, Deserialize)]
struct Property {
    #[serde(rename = "electricityMeterPoints", default)]
    electricity_meter_points: Vec<MeterPoint>,
    #[serde(rename = "gasMeterPoints", default)]
    gas_meter_points: Vec<MeterPoint>,
}

#[derive(Debug, Deserialize)]
struct MeterPoint {
    #[serde(default)]
    meters: Vec<MeterNode>,
}

#[derive(Debug, Deserialize)]
struct MeterNode {
    id: String,
    #[serde(rename = "serialNumber")]
    serial_number: String,
}

impl Operation for AccountMeters {
    const NAME: &'static str = "AccountMeters";
    const QUERY: &'static str = r#"
query AccountMeters($accountNumber: String!) {
  account(accountNumber: $accountNumber) {
    properties {
      electricityMeterPoints {
        meters {
          id
          serialNumber
        }
      }
      gasMeterPoints {
        meters {
          id
          serialNumber
        }
      }
    }
  }
}"#;

    type Data = AccountMetersData;
    type Output = Vec<Meter>;

    fn extract(&self, data: Self::Data) -> Result<Self::Output, SyncError> {
        let account = data.account.ok_or_else(|| {
            SyncError::Remote(format!("Account {} not found", self.account_number))
        })?;

        let mut meters = Vec::new();
        for property in account.properties {
            let points = property
                .electricity_meter_points
                .into_iter()
                .map(|p| (MeterKind::Electricity, p))
                .chain(
                    property
                        .gas_meter_points
                        .into_iter()
                        .map(|p| (MeterKind::Gas, p)),
                );
            for (kind, point) in points {
                for node in point.meters {
                    meters.push(Meter {
                        serial: node.serial_number,
                        kind,
                        remote_id: node.id,
                        account_number: self.account_number.clone(),
                    });
                }
            }
        }
        Ok(meters)
    }
}

// ============================================================================
// MeterConsumption
// ============================================================================

/// One page of half-hourly readings for a meter within a window
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterConsumption {
    account_number: String,
    meter_id: String,
    start_at: String,
    end_at: String,
    first: usize,
    after: Option<String>,
}

impl MeterConsumption {
    pub fn new(meter: &Meter, window: &SyncWindow, first: usize, after: Option<String>) -> Self {
        Self {
            account_number: meter.account_number.clone(),
            meter_id: meter.remote_id.clone(),
            start_at: format_instant(window.start),
            end_at: format_instant(window.end),
            first,
            after,
        }
    }

    #[cfg(test)]
    pub fn first(&self) -> usize {
        self.first
    }

    #[cfg(test)]
    pub fn after(&self) -> Option<&str> {
        self.after.as_deref()
    }

    #[cfg(test)]
    pub fn window(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let start = crate::models::parse_instant(&self.start_at).ok()?;
        let end = crate::models::parse_instant(&self.end_at).ok()?;
        Some((start, end))
    }
}

#[derive(Debug, Deserialize)]
pub struct MeterConsumptionData {
    account: Option<ConsumptionAccount>,
}

#[derive(Debug, Deserialize)]
struct ConsumptionAccount {
    meter: Option<ConsumptionMeter>,
}

#[derive(Debug, Deserialize)]
struct ConsumptionMeter {
    consumption: Option<Connection>,
}

#[derive(Debug, Deserialize)]
struct Connection {
    #[serde(default)]
    edges: Vec<Edge>,
    #[serde(rename = "pageInfo")]
    page_info: PageInfo,
}

#[derive(Debug, Deserialize)]
struct Edge {
    node: ReadingNode,
}

#[derive(Debug, Deserialize)]
struct ReadingNode {
    #[serde(rename = "startAt")]
    start_at: String,
    #[serde(rename = "endAt")]
    end_at: String,
    value: Value,
}

#[derive(Debug, Deserialize)]
struct PageInfo {
    #[serde(rename = "hasNextPage")]
    has_next_page: bool,
    #[serde(rename = "endCursor")]
    end_cursor: Option<String>,
}

/// Amounts arrive as text; bare JSON numbers are tolerated via their literal
fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl Operation for MeterConsumption {
    const NAME: &'static str = "MeterConsumption";
    const QUERY: &'static str = r#"
query MeterConsumption($accountNumber: String!, $meterId: String!, $startAt: DateTime!, $endAt: DateTime!, $first: Int!, $after: String) {
  account(accountNumber: $accountNumber) {
    meter(meterId: $meterId) {
      consumption(startAt: $startAt, endAt: $endAt, grouping: HALF_HOUR, first: $first, after: $after) {
        edges {
          node {
            startAt
            endAt
            value
          }
        }
        pageInfo {
          hasNextPage
          endCursor
        }
      }
    }
  }
}"#;

    type Data = MeterConsumptionData;
    type Output = ConsumptionPage;

    fn extract(&self, data: Self::Data) -> Result<Self::Output, SyncError> {
        let connection = data
            .account
            .and_then(|a| a.meter)
            .and_then(|m| m.consumption)
            .ok_or_else(|| {
                SyncError::Remote(format!("Meter {} not found on account", self.meter_id))
            })?;

        let mut records = Vec::with_capacity(connection.edges.len());
        for edge in connection.edges {
            let node = edge.node;
            let value = value_text(&node.value).unwrap_or_else(|| node.value.to_string());
            records.push(ConsumptionRecord::from_wire(
                &node.start_at,
                &node.end_at,
                &value,
            )?);
        }

        Ok(ConsumptionPage {
            records,
            end_cursor: connection.page_info.end_cursor,
            has_next_page: connection.page_info.has_next_page,
        })
    }
}
