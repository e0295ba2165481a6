//! Data models for eon-sync

use chrono::{DateTime, Duration, FixedOffset, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::RecordRejection;

/// Width of one consumption interval
pub const INTERVAL_MINUTES: i64 = 30;

/// Intervals recorded per day
pub const INTERVALS_PER_DAY: i64 = 24 * 60 / INTERVAL_MINUTES;

pub fn interval_width() -> Duration {
    Duration::minutes(INTERVAL_MINUTES)
}

/// Canonical storage form: UTC with an explicit `+00:00` offset
pub fn format_instant(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Secs, false)
}

pub fn parse_instant(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::<FixedOffset>::parse_from_rfc3339(value).map(|dt| dt.with_timezone(&Utc))
}

// ============================================================================
// Session Models
// ============================================================================

/// Short-lived bearer credential; replaced, never mutated
#[derive(Clone)]
pub struct Credential {
    token: String,
    expires_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// True while `now + margin` is still before expiry
    pub fn is_valid_at(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        now + margin < self.expires_at
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

// ============================================================================
// Meter Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeterKind {
    #[serde(rename = "electricity")]
    Electricity,
    #[serde(rename = "gas")]
    Gas,
}

impl std::fmt::Display for MeterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MeterKind::Electricity => write!(f, "electricity"),
            MeterKind::Gas => write!(f, "gas"),
        }
    }
}

impl std::str::FromStr for MeterKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "electricity" => Ok(MeterKind::Electricity),
            "gas" => Ok(MeterKind::Gas),
            _ => Err(format!("Unknown meter kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Meter {
    pub serial: String,
    pub kind: MeterKind,
    /// Opaque remote id used to parameterise consumption queries
    pub remote_id: String,
    pub account_number: String,
}

// ============================================================================
// Consumption Models
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumptionRecord {
    pub interval_start: DateTime<FixedOffset>,
    pub interval_end: DateTime<FixedOffset>,
    pub value: Decimal,
}

impl ConsumptionRecord {
    /// Parse the textual form delivered by the remote source or a CSV file
    pub fn from_wire(start: &str, end: &str, value: &str) -> Result<Self, RecordRejection> {
        let interval_start = DateTime::parse_from_rfc3339(start.trim()).map_err(|e| {
            RecordRejection::new(start, format!("unparseable interval_start: {}", e))
        })?;
        let interval_end = DateTime::parse_from_rfc3339(end.trim())
            .map_err(|e| RecordRejection::new(start, format!("unparseable interval_end: {}", e)))?;
        let value = value
            .trim()
            .parse::<Decimal>()
            .or_else(|_| Decimal::from_scientific(value.trim()))
            .map_err(|_| RecordRejection::new(start, format!("unparseable value {:?}", value)))?;

        Ok(Self {
            interval_start,
            interval_end,
            value,
        })
    }

    pub fn start_utc(&self) -> DateTime<Utc> {
        self.interval_start.with_timezone(&Utc)
    }

    pub fn end_utc(&self) -> DateTime<Utc> {
        self.interval_end.with_timezone(&Utc)
    }

    /// Schema checks applied before a record may be stored
    pub fn validate(&self) -> Result<(), RecordRejection> {
        if self.value.is_sign_negative() && !self.value.is_zero() {
            return Err(RecordRejection::at(
                self.start_utc(),
                format!("negative value {}", self.value),
            ));
        }
        let width = self.interval_end - self.interval_start;
        if width != interval_width() {
            return Err(RecordRejection::at(
                self.start_utc(),
                format!(
                    "interval width is {} minutes, expected {}",
                    width.num_minutes(),
                    INTERVAL_MINUTES
                ),
            ));
        }
        Ok(())
    }
}

/// Textual reading in the tabular export layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireReading {
    pub interval_start: String,
    pub interval_end: String,
    #[serde(rename = "consumption_kwh")]
    pub value: String,
}

impl WireReading {
    pub fn parse(&self) -> Result<ConsumptionRecord, RecordRejection> {
        ConsumptionRecord::from_wire(&self.interval_start, &self.interval_end, &self.value)
    }
}

/// One row of the local consumption table
#[derive(Debug, Clone, Serialize)]
pub struct StoredRecord {
    pub meter_serial: String,
    pub meter_type: MeterKind,
    pub interval_start: DateTime<Utc>,
    pub interval_end: DateTime<Utc>,
    pub consumption_kwh: f64,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Fetch Models
// ============================================================================

/// Half-open `[start, end)` fetch window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl SyncWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

impl std::fmt::Display for SyncWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}, {})",
            format_instant(self.start),
            format_instant(self.end)
        )
    }
}

/// Flat result of one consumption page request
#[derive(Debug, Clone, Default)]
pub struct ConsumptionPage {
    pub records: Vec<ConsumptionRecord>,
    pub end_cursor: Option<String>,
    pub has_next_page: bool,
}

/// Emitted after every page; observers must not block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchProgress {
    pub page_index: usize,
    pub record_count: usize,
}

// ============================================================================
// Merge / Sync Results
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeOutcome {
    pub inserted: usize,
    pub skipped: usize,
    pub errors: Vec<RecordRejection>,
}

impl MergeOutcome {
    pub fn absorb(&mut self, other: MergeOutcome) {
        self.inserted += other.inserted;
        self.skipped += other.skipped;
        self.errors.extend(other.errors);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub meter_serial: String,
    pub window: SyncWindow,
    pub records_examined: usize,
    pub inserted_count: usize,
    pub skipped_count: usize,
    pub rejected: Vec<RecordRejection>,
    pub final_high_water_mark: Option<DateTime<Utc>>,
}
