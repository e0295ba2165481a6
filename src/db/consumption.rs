//! Consumption table operations

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use sqlx::{QueryBuilder, Sqlite};

use crate::error::{RecordRejection, SyncError};
use crate::models::{
    format_instant, parse_instant, ConsumptionRecord, MergeOutcome, Meter, MeterKind,
    StoredRecord, WireReading,
};

use super::ConsumptionStore;

#[derive(Debug, sqlx::FromRow)]
struct ConsumptionRow {
    meter_serial: String,
    meter_type: String,
    interval_start: String,
    interval_end: String,
    consumption_kwh: f64,
    created_at: String,
}

fn decode_error(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> sqlx::Error {
    sqlx::Error::Decode(err.into())
}

impl TryFrom<ConsumptionRow> for StoredRecord {
    type Error = sqlx::Error;

    fn try_from(row: ConsumptionRow) -> Result<Self, Self::Error> {
        Ok(StoredRecord {
            meter_type: row.meter_type.parse::<MeterKind>().map_err(decode_error)?,
            interval_start: parse_instant(&row.interval_start).map_err(decode_error)?,
            interval_end: parse_instant(&row.interval_end).map_err(decode_error)?,
            created_at: parse_instant(&row.created_at).map_err(decode_error)?,
            consumption_kwh: row.consumption_kwh,
            meter_serial: row.meter_serial,
        })
    }
}

impl ConsumptionStore {
    /// interval_end of the latest stored interval for a meter (the high-water-mark)
    pub async fn latest_position(
        &self,
        meter_serial: &str,
    ) -> Result<Option<DateTime<Utc>>, SyncError> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT interval_end
            FROM consumption
            WHERE meter_serial = ?
            ORDER BY interval_start DESC
            LIMIT 1
            "#,
        )
        .bind(meter_serial)
        .fetch_optional(&self.pool)
        .await?;

        let position = row
            .map(|(end,)| parse_instant(&end).map_err(decode_error))
            .transpose()?;
        Ok(position)
    }

    /// Insert every valid record in one transaction; existing keys are skipped
    pub async fn merge(
        &self,
        meter: &Meter,
        records: &[ConsumptionRecord],
    ) -> Result<MergeOutcome, SyncError> {
        self.merge_checked(meter, records, Vec::new()).await
    }

    /// Merge textual readings; rows that fail to parse land in the error list
    pub async fn merge_wire(
        &self,
        meter: &Meter,
        readings: &[WireReading],
    ) -> Result<MergeOutcome, SyncError> {
        let mut records = Vec::with_capacity(readings.len());
        let mut rejected = Vec::new();
        for reading in readings {
            match reading.parse() {
                Ok(record) => records.push(record),
                Err(rejection) => rejected.push(rejection),
            }
        }
        self.merge_checked(meter, &records, rejected).await
    }

    async fn merge_checked(
        &self,
        meter: &Meter,
        records: &[ConsumptionRecord],
        rejected: Vec<RecordRejection>,
    ) -> Result<MergeOutcome, SyncError> {
        let mut outcome = MergeOutcome {
            errors: rejected,
            ..Default::default()
        };
        let created_at = format_instant(Utc::now());
        let meter_type = meter.kind.to_string();

        let mut tx = self.pool.begin().await?;

        for record in records {
            if let Err(rejection) = record.validate() {
                outcome.errors.push(rejection);
                continue;
            }
            let Some(kwh) = record.value.to_f64().filter(|v| v.is_finite()) else {
                outcome.errors.push(RecordRejection::at(
                    record.start_utc(),
                    format!("value {} not representable", record.value),
                ));
                continue;
            };

            let result = sqlx::query(
                r#"
                INSERT INTO consumption
                (meter_serial, meter_type, interval_start, interval_end, consumption_kwh, created_at)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(meter_serial, interval_start) DO NOTHING
                "#,
            )
            .bind(&meter.serial)
            .bind(&meter_type)
            .bind(format_instant(record.start_utc()))
            .bind(format_instant(record.end_utc()))
            .bind(kwh)
            .bind(&created_at)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 1 {
                outcome.inserted += 1;
            } else {
                outcome.skipped += 1;
            }
        }

        tx.commit().await?;

        tracing::info!(
            "[Store] {} merge: {} inserted, {} skipped, {} rejected",
            meter.serial,
            outcome.inserted,
            outcome.skipped,
            outcome.errors.len()
        );
        Ok(outcome)
    }

    /// Total stored records for a meter
    pub async fn count(&self, meter_serial: &str) -> Result<i64, SyncError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM consumption WHERE meter_serial = ?")
                .bind(meter_serial)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Total stored records across all meters
    pub async fn count_all(&self) -> Result<i64, SyncError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM consumption")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Meters with stored data, as (serial, kind)
    pub async fn stored_meters(&self) -> Result<Vec<(String, MeterKind)>, SyncError> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT meter_serial, MIN(meter_type)
            FROM consumption
            GROUP BY meter_serial
            ORDER BY meter_serial
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut meters = Vec::with_capacity(rows.len());
        for (serial, kind) in rows {
            meters.push((serial, kind.parse::<MeterKind>().map_err(decode_error)?));
        }
        Ok(meters)
    }

    /// Stored records for a meter, ascending, optionally bounded to `[from, to)`
    pub async fn records(
        &self,
        meter_serial: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<StoredRecord>, SyncError> {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT meter_serial, meter_type, interval_start, interval_end, consumption_kwh, created_at \
             FROM consumption WHERE meter_serial = ",
        );
        query.push_bind(meter_serial);
        if let Some(from) = from {
            query.push(" AND interval_start >= ").push_bind(format_instant(from));
        }
        if let Some(to) = to {
            query.push(" AND interval_start < ").push_bind(format_instant(to));
        }
        query.push(" ORDER BY interval_start ASC");

        let rows: Vec<ConsumptionRow> = query.build_query_as().fetch_all(&self.pool).await?;

        let records = rows
            .into_iter()
            .map(StoredRecord::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }
}
