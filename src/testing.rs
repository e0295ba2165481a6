//! In-process stand-in for the metering API used by unit tests

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;

use crate::eon::{MeterConsumption, MeteringApi};
use crate::error::SyncError;
use crate::models::{
    interval_width, ConsumptionPage, ConsumptionRecord, Credential, Meter, MeterKind,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transient,
    AuthExpired,
    Remote,
}

impl FailureKind {
    fn into_error(self) -> SyncError {
        match self {
            FailureKind::Transient => SyncError::Transient("simulated timeout".to_string()),
            FailureKind::AuthExpired => SyncError::AuthenticationExpired,
            FailureKind::Remote => SyncError::Remote("simulated operational error".to_string()),
        }
    }
}

/// Serves a fixed record set, windowed and paged exactly like the remote source
pub struct SimulatedSource {
    records: Mutex<Vec<ConsumptionRecord>>,
    password: String,
    token_lifetime: Duration,
    logins: AtomicUsize,
    login_failures: Mutex<VecDeque<FailureKind>>,
    /// consumption request number (0-based) → failure to inject
    page_failures: Mutex<HashMap<usize, FailureKind>>,
    requests: Mutex<Vec<MeterConsumption>>,
}

impl SimulatedSource {
    pub fn new(records: Vec<ConsumptionRecord>) -> Self {
        Self {
            records: Mutex::new(records),
            password: "testpass".to_string(),
            token_lifetime: Duration::hours(1),
            logins: AtomicUsize::new(0),
            login_failures: Mutex::new(VecDeque::new()),
            page_failures: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_password(mut self, password: &str) -> Self {
        self.password = password.to_string();
        self
    }

    pub fn with_token_lifetime(mut self, lifetime: Duration) -> Self {
        self.token_lifetime = lifetime;
        self
    }

    pub fn fail_next_login(&self, kind: FailureKind) {
        self.login_failures.lock().unwrap().push_back(kind);
    }

    pub fn fail_request(&self, request_index: usize, kind: FailureKind) {
        self.page_failures.lock().unwrap().insert(request_index, kind);
    }

    pub fn replace_records(&self, records: Vec<ConsumptionRecord>) {
        *self.records.lock().unwrap() = records;
    }

    pub fn login_count(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<MeterConsumption> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl MeteringApi for SimulatedSource {
    async fn authenticate(&self, _username: &str, password: &str) -> Result<Credential, SyncError> {
        if let Some(kind) = self.login_failures.lock().unwrap().pop_front() {
            return Err(kind.into_error());
        }
        if password != self.password {
            return Err(SyncError::Authentication("Invalid credentials".to_string()));
        }
        let n = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Credential::new(
            format!("token-{}", n),
            Utc::now() + self.token_lifetime,
        ))
    }

    async fn account_numbers(&self, _credential: &Credential) -> Result<Vec<String>, SyncError> {
        Ok(vec!["ACC123".to_string()])
    }

    async fn meters(
        &self,
        _credential: &Credential,
        _account_number: &str,
    ) -> Result<Vec<Meter>, SyncError> {
        Ok(vec![test_meter()])
    }

    async fn consumption_page(
        &self,
        _credential: &Credential,
        request: &MeterConsumption,
    ) -> Result<ConsumptionPage, SyncError> {
        let index = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request.clone());
            requests.len() - 1
        };
        if let Some(kind) = self.page_failures.lock().unwrap().remove(&index) {
            return Err(kind.into_error());
        }

        let (start, end) = request
            .window()
            .ok_or_else(|| SyncError::Remote("bad window".to_string()))?;
        let offset: usize = match request.after() {
            Some(cursor) => cursor
                .parse()
                .map_err(|_| SyncError::Remote(format!("bad cursor {}", cursor)))?,
            None => 0,
        };

        let in_window: Vec<ConsumptionRecord> = self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.start_utc() >= start && r.start_utc() < end)
            .cloned()
            .collect();

        let records: Vec<ConsumptionRecord> = in_window
            .iter()
            .skip(offset)
            .take(request.first())
            .cloned()
            .collect();
        let next = offset + records.len();

        Ok(ConsumptionPage {
            has_next_page: next < in_window.len(),
            end_cursor: Some(next.to_string()),
            records,
        })
    }
}

pub fn test_meter() -> Meter {
    Meter {
        serial: "METER123".to_string(),
        kind: MeterKind::Electricity,
        remote_id: "meter-id-123".to_string(),
        account_number: "ACC123".to_string(),
    }
}

/// `count` consecutive half-hour records from `start`, values 0.50, 0.51, ...
pub fn half_hour_records(start: DateTime<Utc>, count: usize) -> Vec<ConsumptionRecord> {
    (0..count)
        .map(|i| {
            let interval_start = start + interval_width() * i as i32;
            ConsumptionRecord {
                interval_start: interval_start.fixed_offset(),
                interval_end: (interval_start + interval_width()).fixed_offset(),
                value: Decimal::new(50 + i as i64, 2),
            }
        })
        .collect()
}
