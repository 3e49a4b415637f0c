//! Scheduled job records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// How often a schedule fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleFrequency {
    /// Fixed interval
    Every(Duration),
    /// Cron expression, 5 or 6 fields
    Cron(String),
}

impl fmt::Display for ScheduleFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleFrequency::Every(d) => write!(f, "every {}s", d.as_secs()),
            ScheduleFrequency::Cron(expr) => write!(f, "cron '{expr}'"),
        }
    }
}

/// Observable state of a registered schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleInfo {
    pub name: String,
    pub frequency: ScheduleFrequency,
    /// Only one node may run the job at a time
    pub singleton: bool,
    pub running: bool,
    pub disabled: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub last_message: Option<String>,
    pub last_error: Option<String>,
    pub run_count: u64,
}

impl ScheduleInfo {
    pub fn new(name: impl Into<String>, frequency: ScheduleFrequency, singleton: bool) -> Self {
        Self {
            name: name.into(),
            frequency,
            singleton,
            running: false,
            disabled: false,
            last_run: None,
            last_message: None,
            last_error: None,
            run_count: 0,
        }
    }
}

/// Cluster-wide lease on a singleton schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleInstance {
    pub schedule: String,
    pub owner: String,
    pub started: DateTime<Utc>,
    pub expires: DateTime<Utc>,
}

impl ScheduleInstance {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires > now
    }
}
