//! Cursor-paginated consumption fetcher
//!
//! Pages are requested strictly one after another, each with the cursor of the
//! page before it. A transport failure is retried with exponential backoff; once
//! the attempts are spent the fetch is abandoned with `SyncError::Fetch`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::SyncConfig;
use crate::eon::{MeterConsumption, MeteringApi};
use crate::error::SyncError;
use crate::models::{ConsumptionRecord, Credential, FetchProgress, Meter, SyncWindow};

pub type ProgressObserver = Arc<dyn Fn(FetchProgress) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            max_attempts: config.retry_attempts.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }

    /// Delay before retry number `attempt` (1-based): base * 2^(attempt-1), capped
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails non-transiently, or attempts run out.
    /// An exhausted run returns the last transient error unchanged.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        "[Retry] {} failed on attempt {}/{}: {} (retrying in {:?})",
                        label,
                        attempt,
                        self.max_attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

pub struct Fetcher {
    api: Arc<dyn MeteringApi>,
    page_size: usize,
    retry: RetryPolicy,
    observer: Option<ProgressObserver>,
}

impl Fetcher {
    pub fn new(api: Arc<dyn MeteringApi>, page_size: usize, retry: RetryPolicy) -> Self {
        Self {
            api,
            page_size,
            retry,
            observer: None,
        }
    }

    pub fn with_progress(mut self, observer: ProgressObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Lazily page through `window`; not restartable once partially consumed
    pub fn pages<'a>(
        &'a self,
        credential: &'a Credential,
        meter: &'a Meter,
        window: SyncWindow,
        cursor_start: Option<String>,
    ) -> ConsumptionPages<'a> {
        ConsumptionPages {
            fetcher: self,
            credential,
            meter,
            window,
            cursor: cursor_start,
            page_index: 0,
            record_count: 0,
            finished: false,
        }
    }

    /// Drain every page; any failure discards what was fetched so far
    #[cfg(test)]
    pub async fn fetch(
        &self,
        credential: &Credential,
        meter: &Meter,
        window: SyncWindow,
        cursor_start: Option<String>,
    ) -> Result<Vec<ConsumptionRecord>, SyncError> {
        let mut pages = self.pages(credential, meter, window, cursor_start);
        let mut records = Vec::new();
        while let Some(page) = pages.next_page().await? {
            records.extend(page);
        }
        Ok(records)
    }
}

pub struct ConsumptionPages<'a> {
    fetcher: &'a Fetcher,
    credential: &'a Credential,
    meter: &'a Meter,
    window: SyncWindow,
    cursor: Option<String>,
    page_index: usize,
    record_count: usize,
    finished: bool,
}

impl ConsumptionPages<'_> {
    /// Next page of records, or `None` once the result set is exhausted
    pub async fn next_page(&mut self) -> Result<Option<Vec<ConsumptionRecord>>, SyncError> {
        if self.finished {
            return Ok(None);
        }

        let request = MeterConsumption::new(
            self.meter,
            &self.window,
            self.fetcher.page_size,
            self.cursor.clone(),
        );
        let api = &self.fetcher.api;
        let credential = self.credential;
        let request = &request;

        let result = self
            .fetcher
            .retry
            .run("consumption page", move || api.consumption_page(credential, request))
            .await;

        let page = match result {
            Ok(page) => page,
            Err(e) => {
                self.finished = true;
                return Err(if e.is_retryable() {
                    SyncError::Fetch {
                        attempts: self.fetcher.retry.max_attempts,
                        source: Box::new(e),
                    }
                } else {
                    e
                });
            }
        };

        self.page_index += 1;
        self.record_count += page.records.len();

        tracing::debug!(
            "[Fetch] {} page {}: {} records (has_next_page={})",
            self.meter.serial,
            self.page_index,
            page.records.len(),
            page.has_next_page
        );

        if let Some(ref observer) = self.fetcher.observer {
            observer(FetchProgress {
                page_index: self.page_index,
                record_count: self.record_count,
            });
        }

        if page.records.is_empty() || !page.has_next_page {
            self.finished = true;
        } else {
            match page.end_cursor {
                Some(cursor) => self.cursor = Some(cursor),
                None => {
                    self.finished = true;
                    return Err(SyncError::Remote(
                        "Page reported more results without a continuation cursor".to_string(),
                    ));
                }
            }
        }

        Ok(Some(page.records))
    }

    pub fn pages_fetched(&self) -> usize {
        self.page_index
    }

    pub fn records_fetched(&self) -> usize {
        self.record_count
    }
}
