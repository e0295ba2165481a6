//! Tabular export/import and consumption statistics

use std::io::{Read, Write};

use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::error::SyncError;
use crate::models::{format_instant, StoredRecord, WireReading, INTERVALS_PER_DAY};

/// Decimal places of exported values
pub const EXPORT_PRECISION: usize = 6;

/// Write `records` as `interval_start,interval_end,consumption_kwh` rows.
/// Returns the number of rows written.
pub fn export_csv<W: Write>(records: &[StoredRecord], writer: W) -> Result<usize, SyncError> {
    let mut wtr = csv::Writer::from_writer(writer);

    // Header is emitted even for an empty export
    wtr.write_record(["interval_start", "interval_end", "consumption_kwh"])?;

    for record in records {
        wtr.write_record([
            format_instant(record.interval_start),
            format_instant(record.interval_end),
            format!("{:.*}", EXPORT_PRECISION, record.consumption_kwh),
        ])?;
    }

    wtr.flush()?;
    Ok(records.len())
}

/// Read rows in the export layout; values are kept as text for record-level validation
pub fn read_csv<R: Read>(reader: R) -> Result<Vec<WireReading>, SyncError> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut readings = Vec::new();
    for result in rdr.deserialize() {
        let reading: WireReading = result?;
        readings.push(reading);
    }
    Ok(readings)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumptionStats {
    pub intervals: usize,
    pub days: Decimal,
    pub total_kwh: Decimal,
    pub average_daily_kwh: Decimal,
    pub average_interval_kwh: Decimal,
    pub peak_kwh: Decimal,
    pub peak_start: DateTime<Utc>,
}

impl ConsumptionStats {
    /// `None` for an empty slice
    pub fn from_records(records: &[StoredRecord]) -> Option<Self> {
        let mut total = Decimal::ZERO;
        let mut peak: Option<(Decimal, DateTime<Utc>)> = None;

        for record in records {
            let value = Decimal::from_f64(record.consumption_kwh)?;
            total += value;
            // First occurrence wins on ties
            if peak.map_or(true, |(best, _)| value > best) {
                peak = Some((value, record.interval_start));
            }
        }

        let (peak_kwh, peak_start) = peak?;
        let intervals = Decimal::from(records.len());
        let days = intervals / Decimal::from(INTERVALS_PER_DAY);

        Some(Self {
            intervals: records.len(),
            days,
            total_kwh: total,
            average_daily_kwh: total / days,
            average_interval_kwh: total / intervals,
            peak_kwh,
            peak_start,
        })
    }
}

impl std::fmt::Display for ConsumptionStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Period: {} days ({} half-hour intervals)",
            self.days.round_dp(2),
            self.intervals
        )?;
        writeln!(f, "Total Consumption: {} kWh", self.total_kwh.round_dp(2))?;
        writeln!(f, "Average Daily: {} kWh/day", self.average_daily_kwh.round_dp(2))?;
        writeln!(
            f,
            "Average per interval: {} kWh",
            self.average_interval_kwh.round_dp(3)
        )?;
        writeln!(f, "Peak Usage: {} kWh", self.peak_kwh.round_dp(2))?;
        write!(f, "Peak Time: {}", format_instant(self.peak_start))
    }
}
