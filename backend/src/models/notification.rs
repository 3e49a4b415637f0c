//! Notification (queue event) model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::gav::Gav;
use super::response::RefreshResponse;
use crate::error::{AppError, Result};

/// The fixed vocabulary of work the queue carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationAction {
    /// Refresh one concrete version
    Refresh,
    /// Enumerate every version of an artifact and cascade one refresh each
    RefreshAllVersions,
    /// Soft-delete a cached version
    Evict,
    /// Hard-delete a cached version
    Delete,
    /// Flag a cached version as missing from the repository
    Deprecate,
}

impl NotificationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationAction::Refresh => "refresh",
            NotificationAction::RefreshAllVersions => "refresh_all_versions",
            NotificationAction::Evict => "evict",
            NotificationAction::Delete => "delete",
            NotificationAction::Deprecate => "deprecate",
        }
    }

    /// Actions that act on the catalog directly instead of calling the handler.
    pub fn is_catalog_action(&self) -> bool {
        matches!(
            self,
            NotificationAction::Evict | NotificationAction::Delete | NotificationAction::Deprecate
        )
    }
}

/// Where a notification is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    /// Waiting in the active queue
    Pending,
    /// Processed successfully, retained for audit
    Completed,
    /// Attempts exhausted or terminal failure, retained for audit
    Failed,
}

/// Outcome of one processing attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationResponse {
    pub messages: Vec<String>,
    pub errors: Vec<String>,
    pub at: Option<DateTime<Utc>>,
}

impl NotificationResponse {
    pub fn from_refresh(response: &RefreshResponse, at: DateTime<Utc>) -> Self {
        Self {
            messages: response.messages.clone(),
            errors: response.errors.clone(),
            at: Some(at),
        }
    }

    pub fn error(message: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            messages: Vec::new(),
            errors: vec![message.into()],
            at: Some(at),
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// A unit of work in the notification queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Assigned by the queue on first push; empty until then
    pub event_id: String,
    pub project_id: Option<String>,
    pub group_id: String,
    pub artifact_id: String,
    pub version_id: String,
    pub action: NotificationAction,
    pub parent_event_id: Option<String>,
    pub full_update: bool,
    pub transitive: bool,
    pub attempt: u32,
    pub max_attempts: u32,
    pub priority: i32,
    pub status: NotificationStatus,
    /// Attempt number -> outcome
    pub responses: BTreeMap<u32, NotificationResponse>,
    /// Earliest time the event may be picked up again (retry backoff)
    pub not_before: Option<DateTime<Utc>>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub completed: Option<DateTime<Utc>>,
}

impl Notification {
    /// Build a pending notification for `gav`. The event id is assigned on push.
    pub fn new(gav: &Gav, action: NotificationAction, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            event_id: String::new(),
            project_id: None,
            group_id: gav.group_id.clone(),
            artifact_id: gav.artifact_id.clone(),
            version_id: gav.version_id.clone(),
            action,
            parent_event_id: None,
            full_update: false,
            transitive: false,
            attempt: 0,
            max_attempts,
            priority: 0,
            status: NotificationStatus::Pending,
            responses: BTreeMap::new(),
            not_before: None,
            created: now,
            updated: now,
            completed: None,
        }
    }

    pub fn refresh(gav: &Gav, max_attempts: u32) -> Self {
        Self::new(gav, NotificationAction::Refresh, max_attempts)
    }

    pub fn refresh_all_versions(group_id: &str, artifact_id: &str, max_attempts: u32) -> Self {
        Self::new(
            &Gav::all_versions(group_id, artifact_id),
            NotificationAction::RefreshAllVersions,
            max_attempts,
        )
    }

    pub fn with_project_id(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn with_parent(mut self, parent_event_id: impl Into<String>) -> Self {
        self.parent_event_id = Some(parent_event_id.into());
        self
    }

    pub fn with_full_update(mut self, full_update: bool) -> Self {
        self.full_update = full_update;
        self
    }

    pub fn with_transitive(mut self, transitive: bool) -> Self {
        self.transitive = transitive;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn gav(&self) -> Gav {
        Gav::new(&self.group_id, &self.artifact_id, &self.version_id)
    }

    /// Key used for the refresh status ledger.
    pub fn ledger_key(&self) -> Gav {
        match self.action {
            NotificationAction::RefreshAllVersions => {
                Gav::all_versions(&self.group_id, &self.artifact_id)
            }
            _ => self.gav(),
        }
    }

    /// A child event cascaded from this one for `gav`.
    pub fn child(&self, gav: &Gav, action: NotificationAction) -> Self {
        let mut child = Self::new(gav, action, self.max_attempts);
        child.project_id = self.project_id.clone();
        child.parent_event_id = Some(self.event_id.clone());
        child.full_update = self.full_update;
        child.transitive = self.transitive;
        child.priority = self.priority;
        child
    }

    /// Required correlation fields must be present and well formed.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(AppError::Validation("maxAttempts must be at least 1".into()));
        }
        if self.attempt > self.max_attempts {
            return Err(AppError::Validation(format!(
                "attempt {} exceeds maxAttempts {}",
                self.attempt, self.max_attempts
            )));
        }
        match self.action {
            NotificationAction::RefreshAllVersions => {
                super::gav::validate_part("groupId", &self.group_id)?;
                super::gav::validate_part("artifactId", &self.artifact_id)
            }
            _ => {
                let gav = self.gav();
                gav.validate()?;
                if gav.is_all_versions() {
                    return Err(AppError::Validation(format!(
                        "'{}' is reserved and cannot be used as a versionId for {}",
                        super::gav::ALL_VERSIONS,
                        self.action.as_str()
                    )));
                }
                Ok(())
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status != NotificationStatus::Pending
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Whether the event may be picked up at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.not_before.map_or(true, |t| t <= now)
    }

    /// Record the outcome of the current attempt.
    pub fn record_response(&mut self, response: NotificationResponse) {
        self.updated = response.at.unwrap_or_else(Utc::now);
        self.responses.insert(self.attempt, response);
    }

    /// Every error across all attempts, oldest first.
    pub fn accumulated_errors(&self) -> Vec<String> {
        self.responses
            .iter()
            .flat_map(|(attempt, r)| r.errors.iter().map(move |e| format!("[attempt {attempt}] {e}")))
            .collect()
    }
}
