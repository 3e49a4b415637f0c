//! Refresh status ledger record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::gav::Gav;
use super::response::RefreshResponse;

/// Run record for one `(group, artifact, version)` key.
///
/// A record with `running == true` and `expires` in the future is a live
/// lease: nobody else may start work on the key until it is released or the
/// lease lapses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshStatus {
    pub key: Gav,
    pub running: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    /// Duration of the last completed run in milliseconds
    pub duration_ms: Option<i64>,
    pub response: Option<RefreshResponse>,
    pub expires: Option<DateTime<Utc>>,
    /// Event currently holding the lease
    pub event_id: Option<String>,
}

impl RefreshStatus {
    pub fn new(key: Gav) -> Self {
        Self {
            key,
            running: false,
            start_time: None,
            last_run: None,
            duration_ms: None,
            response: None,
            expires: None,
            event_id: None,
        }
    }

    /// Running and not yet expired at `now`.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.running && self.expires.map_or(false, |e| e > now)
    }

    /// Running but the lease has lapsed (the holder presumably crashed).
    pub fn is_abandoned(&self, now: DateTime<Utc>) -> bool {
        self.running && !self.is_active(now)
    }

    /// Take the lease at `now`.
    pub fn start(&mut self, now: DateTime<Utc>, lease: chrono::Duration, event_id: Option<String>) {
        self.running = true;
        self.start_time = Some(now);
        self.expires = Some(now + lease);
        self.event_id = event_id;
    }

    /// Release the lease and record the run outcome.
    pub fn finish(&mut self, now: DateTime<Utc>, response: RefreshResponse) {
        self.running = false;
        self.last_run = Some(now);
        self.duration_ms = self.start_time.map(|s| (now - s).num_milliseconds());
        self.response = Some(response);
        self.expires = None;
        self.event_id = None;
    }
}
