//! eon-sync - E.ON Next consumption sync
//!
//! Pulls half-hourly smart meter readings from the E.ON Next API and merges
//! them incrementally into a local SQLite database.

mod cli;
mod config;
mod db;
mod eon;
mod error;
mod fetch;
mod models;
mod report;
mod session;
mod sync;
#[cfg(test)]
mod testing;

use std::fs::File;
use std::io::BufWriter;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::{Cli, Commands};
use crate::config::Config;
use crate::db::ConsumptionStore;
use crate::eon::{EonClient, MeteringApi};
use crate::error::SyncError;
use crate::fetch::{Fetcher, RetryPolicy};
use crate::models::{format_instant, FetchProgress, Meter, MeterKind, SyncSummary};
use crate::report::ConsumptionStats;
use crate::session::SessionManager;
use crate::sync::SyncOrchestrator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries exports and summaries
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "eon_sync=info".into()),
        )
        .init();

    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    tracing::debug!("Configuration loaded");

    match cli.command {
        Commands::Sync { meter, days, json } => run_sync(&config, meter, days, json).await,
        Commands::Export { meter, days, output } => run_export(&config, meter, days, output).await,
        Commands::Import { path, meter, kind } => run_import(&config, path, meter, kind).await,
        Commands::Stats { meter, days } => run_stats(&config, meter, days).await,
        Commands::Meters => run_meters(&config).await,
    }
}

fn session_for(config: &Config, api: Arc<dyn MeteringApi>) -> Result<Arc<SessionManager>, SyncError> {
    let (username, password) = config.api.credentials()?;
    Ok(Arc::new(SessionManager::new(
        api,
        username,
        password,
        config.api.expiry_margin(),
    )))
}

async fn run_sync(
    config: &Config,
    meter: Option<String>,
    days: Option<i64>,
    json: bool,
) -> anyhow::Result<()> {
    let horizon = sync::horizon_from_days(days.unwrap_or(config.sync.default_horizon_days))?;

    let api: Arc<dyn MeteringApi> = Arc::new(EonClient::new(&config.api)?);
    let session = session_for(config, api.clone())?;
    let retry = RetryPolicy::from_config(&config.sync);

    let credential = {
        let session = &session;
        retry
            .run("authentication", move || session.acquire())
            .await
            .context("Login failed")?
    };
    let meter = eon::discover_meter(api.as_ref(), &credential, meter.as_deref()).await?;

    let store = ConsumptionStore::connect(&config.database).await?;

    let fetcher = Fetcher::new(api, config.sync.page_size, retry.clone()).with_progress(Arc::new(
        |progress: FetchProgress| {
            tracing::info!(
                "[Fetch] Page {} received ({} records so far)",
                progress.page_index,
                progress.record_count
            );
        },
    ));

    let orchestrator = SyncOrchestrator::new(
        session,
        fetcher,
        store,
        retry,
        config.sync.max_buffered_records,
    );

    let summary = orchestrator
        .sync(&meter, horizon)
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&meter, &summary);
    }
    Ok(())
}

fn print_summary(meter: &Meter, summary: &SyncSummary) {
    println!("Meter: {} ({})", meter.serial, meter.kind);
    println!("Window: {}", summary.window);
    println!("Records examined: {}", summary.records_examined);
    println!("Inserted: {}", summary.inserted_count);
    println!("Skipped: {}", summary.skipped_count);
    if !summary.rejected.is_empty() {
        println!("Rejected: {}", summary.rejected.len());
        for rejection in &summary.rejected {
            println!("  {}", rejection);
        }
    }
    match summary.final_high_water_mark {
        Some(hwm) => println!("Data through: {}", format_instant(hwm)),
        None => println!("Data through: (no data stored)"),
    }
}

/// Resolve the serial to report on from the flag or the only meter in the store
async fn stored_serial(store: &ConsumptionStore, meter: Option<String>) -> anyhow::Result<String> {
    if let Some(serial) = meter {
        return Ok(serial);
    }
    let meters = store.stored_meters().await?;
    match meters.as_slice() {
        [] => anyhow::bail!("Database contains no consumption data"),
        [(serial, _)] => Ok(serial.clone()),
        many => {
            let serials: Vec<&str> = many.iter().map(|(s, _)| s.as_str()).collect();
            anyhow::bail!(
                "Database holds several meters, pass --meter (one of: {})",
                serials.join(", ")
            )
        }
    }
}

async fn run_export(
    config: &Config,
    meter: Option<String>,
    days: Option<i64>,
    output: Option<std::path::PathBuf>,
) -> anyhow::Result<()> {
    let store = ConsumptionStore::connect(&config.database).await?;
    let serial = stored_serial(&store, meter).await?;
    let from = days
        .map(|d| sync::lookback_start(d, chrono::Utc::now()))
        .transpose()?;
    let records = store.records(&serial, from, None).await?;

    let written = match output {
        Some(ref path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            report::export_csv(&records, BufWriter::new(file))?
        }
        None => report::export_csv(&records, std::io::stdout().lock())?,
    };

    tracing::info!("Exported {} records for {}", written, serial);
    Ok(())
}

async fn run_import(
    config: &Config,
    path: std::path::PathBuf,
    serial: String,
    kind: MeterKind,
) -> anyhow::Result<()> {
    let file =
        File::open(&path).with_context(|| format!("Failed to open {}", path.display()))?;
    let readings = report::read_csv(file)?;

    let store = ConsumptionStore::connect(&config.database).await?;
    let meter = Meter {
        serial,
        kind,
        remote_id: String::new(),
        account_number: String::new(),
    };
    let outcome = store.merge_wire(&meter, &readings).await?;

    for rejection in &outcome.errors {
        tracing::warn!("[Store] Rejected row: {}", rejection);
    }
    println!(
        "Imported {} rows into {}: {} inserted, {} skipped, {} rejected",
        readings.len(),
        meter.serial,
        outcome.inserted,
        outcome.skipped,
        outcome.errors.len()
    );
    println!(
        "Database holds {} records for {} ({} across all meters)",
        store.count(&meter.serial).await?,
        meter.serial,
        store.count_all().await?
    );
    Ok(())
}

async fn run_stats(config: &Config, meter: Option<String>, days: Option<i64>) -> anyhow::Result<()> {
    let store = ConsumptionStore::connect(&config.database).await?;
    let serial = stored_serial(&store, meter).await?;
    let from = days
        .map(|d| sync::lookback_start(d, chrono::Utc::now()))
        .transpose()?;
    let records = store.records(&serial, from, None).await?;

    match ConsumptionStats::from_records(&records) {
        Some(stats) => {
            println!("Meter Serial: {}", serial);
            println!("{}", stats);
        }
        None => eprintln!("No consumption data available for analysis."),
    }
    Ok(())
}

async fn run_meters(config: &Config) -> anyhow::Result<()> {
    let api: Arc<dyn MeteringApi> = Arc::new(EonClient::new(&config.api)?);
    let session = session_for(config, api.clone())?;
    let credential = session.acquire().await.context("Login failed")?;

    let meters = eon::list_meters(api.as_ref(), &credential).await?;
    for meter in &meters {
        println!("{}\t{}\t{}", meter.serial, meter.kind, meter.account_number);
    }
    Ok(())
}
