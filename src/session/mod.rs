//! SessionManager: credential lifecycle against the metering API
//!
//! Holds at most one token. `acquire` re-authenticates when none is held or the
//! held one is inside the expiry margin; `invalidate` forces the next login.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::RwLock;

use crate::eon::MeteringApi;
use crate::error::SyncError;
use crate::models::Credential;

pub struct SessionManager {
    api: Arc<dyn MeteringApi>,
    username: String,
    password: String,
    expiry_margin: Duration,
    credential: RwLock<Option<Credential>>,
}

impl SessionManager {
    pub fn new(
        api: Arc<dyn MeteringApi>,
        username: String,
        password: String,
        expiry_margin: Duration,
    ) -> Self {
        Self {
            api,
            username,
            password,
            expiry_margin,
            credential: RwLock::new(None),
        }
    }

    /// Return a currently-valid credential, logging in again when required
    pub async fn acquire(&self) -> Result<Credential, SyncError> {
        {
            let held = self.credential.read().await;
            if let Some(ref c) = *held {
                if c.is_valid_at(Utc::now(), self.expiry_margin) {
                    return Ok(c.clone());
                }
            }
        }

        let mut held = self.credential.write().await;

        // Another caller may have refreshed while we waited for the write lock
        if let Some(ref c) = *held {
            if c.is_valid_at(Utc::now(), self.expiry_margin) {
                return Ok(c.clone());
            }
        }

        tracing::debug!("[Session] Authenticating as {}", self.username);
        let credential = self.api.authenticate(&self.username, &self.password).await?;

        tracing::info!(
            "[Session] Token acquired, expires at {}",
            credential.expires_at().to_rfc3339()
        );
        *held = Some(credential.clone());
        Ok(credential)
    }

    /// Drop the held credential after the remote side rejected it
    pub async fn invalidate(&self) {
        let mut held = self.credential.write().await;
        if held.take().is_some() {
            tracing::info!("[Session] Credential invalidated");
        }
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("username", &self.username)
            .field("expiry_margin", &self.expiry_margin)
            .finish_non_exhaustive()
    }
}
