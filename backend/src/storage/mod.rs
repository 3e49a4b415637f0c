//! Persistence stores.
//!
//! One async store trait per record set. Each store enforces a uniqueness
//! constraint on its key; the ledger-style stores additionally expose an
//! atomic `try_acquire` so leases can be taken without a read-modify-write
//! race between workers.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::error::Result;
use crate::models::{
    ArtifactDetail, Gav, Notification, ProjectCoordinates, ProjectVersionData, RefreshResponse,
    RefreshStatus, ScheduleInstance,
};

/// Result of a compare-and-set lease attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum LeaseOutcome<T> {
    /// The caller now holds the lease
    Acquired(T),
    /// Someone else holds an unexpired lease
    Held(T),
}

impl<T> LeaseOutcome<T> {
    pub fn is_acquired(&self) -> bool {
        matches!(self, LeaseOutcome::Acquired(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            LeaseOutcome::Acquired(t) | LeaseOutcome::Held(t) => t,
        }
    }
}

/// Notification queue storage: the active queue plus an audit archive.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Insert into the active queue. Fails with `Conflict` on a duplicate id.
    async fn insert(&self, event: Notification) -> Result<()>;

    async fn get(&self, event_id: &str) -> Result<Option<Notification>>;

    /// Active events in dequeue order.
    async fn list_pending(&self) -> Result<Vec<Notification>>;

    /// First due event in dequeue order, without removing it.
    async fn peek_first(&self, now: DateTime<Utc>) -> Result<Option<Notification>>;

    /// Atomically remove and return every due event, in dequeue order.
    async fn take_due(&self, now: DateTime<Utc>) -> Result<Vec<Notification>>;

    /// Atomically remove one event. `None` if another consumer got there first.
    async fn take(&self, event_id: &str) -> Result<Option<Notification>>;

    async fn count_pending(&self) -> Result<usize>;

    async fn clear_pending(&self) -> Result<usize>;

    /// Retain a finished event for audit.
    async fn archive(&self, event: Notification) -> Result<()>;

    async fn get_archived(&self, event_id: &str) -> Result<Option<Notification>>;

    async fn list_archived(&self) -> Result<Vec<Notification>>;

    /// Drop archived events last updated before `cutoff`.
    async fn purge_archived_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

/// Refresh status ledger storage.
#[async_trait]
pub trait RefreshStatusStore: Send + Sync {
    async fn get(&self, key: &Gav) -> Result<Option<RefreshStatus>>;

    async fn list(&self) -> Result<Vec<RefreshStatus>>;

    async fn upsert(&self, status: RefreshStatus) -> Result<()>;

    async fn remove(&self, key: &Gav) -> Result<bool>;

    /// Take the lease on `key` unless an unexpired running record exists.
    async fn try_acquire(
        &self,
        key: &Gav,
        now: DateTime<Utc>,
        lease: chrono::Duration,
        event_id: Option<&str>,
    ) -> Result<LeaseOutcome<RefreshStatus>>;

    /// Release the lease held by `event_id` and record the outcome.
    ///
    /// Returns `None` when the record is missing or the lease has passed to
    /// another holder, in which case nothing is written.
    async fn release(
        &self,
        key: &Gav,
        event_id: Option<&str>,
        now: DateTime<Utc>,
        response: RefreshResponse,
    ) -> Result<Option<RefreshStatus>>;

    /// Reset `running` on every record whose lease has lapsed.
    async fn clear_expired(&self, now: DateTime<Utc>) -> Result<Vec<Gav>>;
}

/// Cache catalog storage.
#[async_trait]
pub trait VersionCatalogStore: Send + Sync {
    async fn get(&self, gav: &Gav) -> Result<Option<ProjectVersionData>>;

    async fn upsert(&self, entry: ProjectVersionData) -> Result<()>;

    async fn remove(&self, gav: &Gav) -> Result<Option<ProjectVersionData>>;

    /// Every entry for `group_id:artifact_id`, evicted ones included.
    async fn list_versions(
        &self,
        group_id: &str,
        artifact_id: &str,
    ) -> Result<Vec<ProjectVersionData>>;

    async fn list_all(&self) -> Result<Vec<ProjectVersionData>>;
}

/// Singleton schedule lease storage.
#[async_trait]
pub trait ScheduleInstanceStore: Send + Sync {
    async fn get(&self, schedule: &str) -> Result<Option<ScheduleInstance>>;

    async fn list(&self) -> Result<Vec<ScheduleInstance>>;

    /// Take the lease on `schedule` unless a live instance exists.
    async fn try_acquire(
        &self,
        schedule: &str,
        owner: &str,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> Result<LeaseOutcome<ScheduleInstance>>;

    /// Drop the instance if `owner` holds it.
    async fn release(&self, schedule: &str, owner: &str) -> Result<bool>;
}

/// Checksum ledger storage, keyed by file path.
#[async_trait]
pub trait ArtifactDetailStore: Send + Sync {
    async fn get(&self, path: &str) -> Result<Option<ArtifactDetail>>;

    async fn upsert(&self, detail: ArtifactDetail) -> Result<()>;

    async fn list_for_version(&self, gav: &Gav) -> Result<Vec<ArtifactDetail>>;

    async fn remove_for_version(&self, gav: &Gav) -> Result<usize>;
}

/// Registry of known projects, keyed by project id.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Insert or replace. Fails with `Conflict` when another project id
    /// already claims the same coordinates.
    async fn upsert(&self, project: ProjectCoordinates) -> Result<()>;

    async fn get(&self, project_id: &str) -> Result<Option<ProjectCoordinates>>;

    async fn find_by_coordinates(
        &self,
        group_id: &str,
        artifact_id: &str,
    ) -> Result<Option<ProjectCoordinates>>;

    async fn list(&self) -> Result<Vec<ProjectCoordinates>>;

    async fn remove(&self, project_id: &str) -> Result<bool>;
}

/// The full set of stores the engine runs on.
#[derive(Clone)]
pub struct Stores {
    pub notifications: Arc<dyn NotificationStore>,
    pub refresh_status: Arc<dyn RefreshStatusStore>,
    pub catalog: Arc<dyn VersionCatalogStore>,
    pub schedules: Arc<dyn ScheduleInstanceStore>,
    pub artifact_details: Arc<dyn ArtifactDetailStore>,
    pub projects: Arc<dyn ProjectStore>,
}

impl Stores {
    /// Process-local stores, for tests and single-node deployments.
    pub fn in_memory() -> Self {
        Self {
            notifications: Arc::new(memory::InMemoryNotificationStore::default()),
            refresh_status: Arc::new(memory::InMemoryRefreshStatusStore::default()),
            catalog: Arc::new(memory::InMemoryVersionCatalogStore::default()),
            schedules: Arc::new(memory::InMemoryScheduleInstanceStore::default()),
            artifact_details: Arc::new(memory::InMemoryArtifactDetailStore::default()),
            projects: Arc::new(memory::InMemoryProjectStore::default()),
        }
    }
}
