//! Sync orchestration: window computation, authentication, fetch and merge
//!
//! One run walks `Idle → WindowComputed → Authenticated → Fetching → Merging → Done`.
//! Every failure ends the run in a terminal stage (`AuthFailed`, `FetchFailed`,
//! `StoreFailed`) reported as a single `SyncFailure`. Records merged before the
//! failure stay in the store.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::db::ConsumptionStore;
use crate::error::SyncError;
use crate::fetch::{Fetcher, RetryPolicy};
use crate::models::{ConsumptionRecord, Credential, MergeOutcome, Meter, SyncSummary, SyncWindow};
use crate::session::SessionManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStage {
    Idle,
    WindowComputed,
    Authenticated,
    Fetching,
    Merging,
    Done,
    AuthFailed,
    FetchFailed,
    StoreFailed,
}

impl std::fmt::Display for SyncStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SyncStage::Idle => "Idle",
            SyncStage::WindowComputed => "WindowComputed",
            SyncStage::Authenticated => "Authenticated",
            SyncStage::Fetching => "Fetching",
            SyncStage::Merging => "Merging",
            SyncStage::Done => "Done",
            SyncStage::AuthFailed => "AuthFailed",
            SyncStage::FetchFailed => "FetchFailed",
            SyncStage::StoreFailed => "StoreFailed",
        };
        write!(f, "{}", name)
    }
}

/// Terminal report of a failed run
#[derive(Debug, thiserror::Error)]
#[error("sync ended in {stage}: {source}")]
pub struct SyncFailure {
    pub stage: SyncStage,
    #[source]
    pub source: SyncError,
}

impl SyncFailure {
    fn new(stage: SyncStage, source: SyncError) -> Self {
        Self { stage, source }
    }
}

/// `[latest_position, now)` when resuming, `[now - horizon, now)` otherwise.
/// A horizon reaching past the representable range starts at the earliest instant.
pub fn compute_window(
    latest_position: Option<DateTime<Utc>>,
    horizon: Duration,
    now: DateTime<Utc>,
) -> SyncWindow {
    match latest_position {
        Some(position) => SyncWindow::new(position, now),
        None => SyncWindow::new(
            now.checked_sub_signed(horizon).unwrap_or(DateTime::<Utc>::MIN_UTC),
            now,
        ),
    }
}

/// Validate a day count given on the command line
pub fn horizon_from_days(days: i64) -> Result<Duration, SyncError> {
    if days <= 0 {
        return Err(SyncError::Config(format!("days must be positive, got {}", days)));
    }
    Duration::try_days(days)
        .ok_or_else(|| SyncError::Config(format!("days out of range: {}", days)))
}

/// Start of the last `days` days before `now`, for report filters
pub fn lookback_start(days: i64, now: DateTime<Utc>) -> Result<DateTime<Utc>, SyncError> {
    Ok(compute_window(None, horizon_from_days(days)?, now).start)
}

struct RunState<'a> {
    serial: &'a str,
    stage: SyncStage,
    examined: usize,
    outcome: MergeOutcome,
}

impl RunState<'_> {
    fn advance(&mut self, next: SyncStage) {
        tracing::debug!("[Sync] {}: {} -> {}", self.serial, self.stage, next);
        self.stage = next;
    }

    fn fail(&mut self, terminal: SyncStage, source: SyncError) -> SyncFailure {
        tracing::error!("[Sync] {}: {} failed: {}", self.serial, self.stage, source);
        self.advance(terminal);
        SyncFailure::new(terminal, source)
    }
}

pub struct SyncOrchestrator {
    session: Arc<SessionManager>,
    fetcher: Fetcher,
    store: ConsumptionStore,
    auth_retry: RetryPolicy,
    max_buffered_records: usize,
}

impl SyncOrchestrator {
    pub fn new(
        session: Arc<SessionManager>,
        fetcher: Fetcher,
        store: ConsumptionStore,
        auth_retry: RetryPolicy,
        max_buffered_records: usize,
    ) -> Self {
        Self {
            session,
            fetcher,
            store,
            auth_retry,
            max_buffered_records: max_buffered_records.max(1),
        }
    }

    pub async fn sync(&self, meter: &Meter, horizon: Duration) -> Result<SyncSummary, SyncFailure> {
        self.sync_at(meter, horizon, Utc::now()).await
    }

    /// Run one sync with `now` as the upper window bound
    pub async fn sync_at(
        &self,
        meter: &Meter,
        horizon: Duration,
        now: DateTime<Utc>,
    ) -> Result<SyncSummary, SyncFailure> {
        let mut run = RunState {
            serial: &meter.serial,
            stage: SyncStage::Idle,
            examined: 0,
            outcome: MergeOutcome::default(),
        };

        let latest = match self.store.latest_position(&meter.serial).await {
            Ok(latest) => latest,
            Err(e) => return Err(run.fail(SyncStage::StoreFailed, e)),
        };
        let window = compute_window(latest, horizon, now);
        run.advance(SyncStage::WindowComputed);

        tracing::info!(
            "[Sync] {} {} window {}",
            meter.serial,
            if latest.is_some() { "resumption" } else { "initial" },
            window
        );

        if window.is_empty() {
            tracing::info!("[Sync] {} is up to date", meter.serial);
        } else {
            let mut reauthenticated = false;
            loop {
                let credential = self.authenticate(&mut run).await?;
                run.advance(SyncStage::Authenticated);

                match self.drain(&credential, meter, window, &mut run).await {
                    Ok(()) => break,
                    Err(SyncError::AuthenticationExpired) if !reauthenticated => {
                        tracing::warn!(
                            "[Sync] {}: credential rejected mid-fetch, restarting from {}",
                            meter.serial,
                            window.start.to_rfc3339()
                        );
                        reauthenticated = true;
                        self.session.invalidate().await;
                        run.advance(SyncStage::WindowComputed);
                    }
                    Err(SyncError::AuthenticationExpired) => {
                        return Err(run.fail(SyncStage::AuthFailed, SyncError::AuthenticationExpired));
                    }
                    Err(e @ SyncError::Storage(_)) => {
                        return Err(run.fail(SyncStage::StoreFailed, e));
                    }
                    Err(e) => return Err(run.fail(SyncStage::FetchFailed, e)),
                }
            }
        }

        let final_high_water_mark = match self.store.latest_position(&meter.serial).await {
            Ok(position) => position,
            Err(e) => return Err(run.fail(SyncStage::StoreFailed, e)),
        };
        run.advance(SyncStage::Done);

        tracing::info!(
            "[Sync] {} done: {} examined, {} inserted, {} skipped, {} rejected",
            meter.serial,
            run.examined,
            run.outcome.inserted,
            run.outcome.skipped,
            run.outcome.errors.len()
        );

        Ok(SyncSummary {
            meter_serial: meter.serial.clone(),
            window,
            records_examined: run.examined,
            inserted_count: run.outcome.inserted,
            skipped_count: run.outcome.skipped,
            rejected: run.outcome.errors,
            final_high_water_mark,
        })
    }

    async fn authenticate(&self, run: &mut RunState<'_>) -> Result<Credential, SyncFailure> {
        let session = &self.session;
        self.auth_retry
            .run("authentication", move || session.acquire())
            .await
            .map_err(|e| run.fail(SyncStage::AuthFailed, e))
    }

    /// Fetch the whole window, merging whenever the buffer fills up.
    /// Records still buffered when a page fails are dropped.
    async fn drain(
        &self,
        credential: &Credential,
        meter: &Meter,
        window: SyncWindow,
        run: &mut RunState<'_>,
    ) -> Result<(), SyncError> {
        let mut pages = self.fetcher.pages(credential, meter, window, None);
        let mut buffer: Vec<ConsumptionRecord> = Vec::new();
        run.advance(SyncStage::Fetching);

        while let Some(records) = pages.next_page().await? {
            buffer.extend(records);
            if buffer.len() >= self.max_buffered_records {
                self.merge(meter, &mut buffer, run).await?;
                run.advance(SyncStage::Fetching);
            }
        }

        tracing::debug!(
            "[Sync] {}: fetched {} records in {} pages",
            meter.serial,
            pages.records_fetched(),
            pages.pages_fetched()
        );

        self.merge(meter, &mut buffer, run).await
    }

    async fn merge(
        &self,
        meter: &Meter,
        buffer: &mut Vec<ConsumptionRecord>,
        run: &mut RunState<'_>,
    ) -> Result<(), SyncError> {
        run.advance(SyncStage::Merging);
        if buffer.is_empty() {
            return Ok(());
        }
        let outcome = self.store.merge(meter, buffer).await?;
        run.examined += buffer.len();
        run.outcome.absorb(outcome);
        buffer.clear();
        Ok(())
    }
}
