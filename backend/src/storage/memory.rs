//! In-memory stores.
//!
//! Every store is a thin wrapper over [`KeyedTable`], a mutex-guarded ordered
//! map that remembers insertion order. Entity-specific behavior lives in the
//! key-filter functions at the bottom of this file.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use super::{
    ArtifactDetailStore, LeaseOutcome, NotificationStore, ProjectStore, RefreshStatusStore,
    ScheduleInstanceStore, VersionCatalogStore,
};
use crate::error::{AppError, Result};
use crate::models::{
    ArtifactDetail, Gav, Notification, ProjectCoordinates, ProjectVersionData, RefreshResponse,
    RefreshStatus, ScheduleInstance,
};

struct Row<V> {
    seq: u64,
    value: V,
}

struct Inner<K, V> {
    rows: BTreeMap<K, Row<V>>,
    next_seq: u64,
}

/// Ordered key/value table with a uniqueness constraint on `K`.
///
/// Listing methods return values in insertion order. Re-inserting an
/// existing key through [`KeyedTable::upsert`] keeps its original position.
pub struct KeyedTable<K, V> {
    inner: Mutex<Inner<K, V>>,
}

impl<K: Ord + Clone, V: Clone> Default for KeyedTable<K, V> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                rows: BTreeMap::new(),
                next_seq: 0,
            }),
        }
    }
}

impl<K: Ord + Clone, V: Clone> KeyedTable<K, V> {
    fn lock(&self) -> Result<MutexGuard<'_, Inner<K, V>>> {
        self.inner
            .lock()
            .map_err(|_| AppError::Storage("in-memory table lock poisoned".into()))
    }

    fn ordered(rows: Vec<&Row<V>>) -> Vec<V> {
        let mut rows = rows;
        rows.sort_by_key(|r| r.seq);
        rows.into_iter().map(|r| r.value.clone()).collect()
    }

    /// Insert a new row. Returns `false` and leaves the table alone if `key`
    /// is already taken.
    pub fn insert_unique(&self, key: K, value: V) -> Result<bool> {
        let mut inner = self.lock()?;
        if inner.rows.contains_key(&key) {
            return Ok(false);
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.rows.insert(key, Row { seq, value });
        Ok(true)
    }

    pub fn upsert(&self, key: K, value: V) -> Result<()> {
        let mut inner = self.lock()?;
        let seq = match inner.rows.get(&key) {
            Some(row) => row.seq,
            None => {
                let seq = inner.next_seq;
                inner.next_seq += 1;
                seq
            }
        };
        inner.rows.insert(key, Row { seq, value });
        Ok(())
    }

    pub fn get(&self, key: &K) -> Result<Option<V>> {
        Ok(self.lock()?.rows.get(key).map(|r| r.value.clone()))
    }

    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        Ok(self.lock()?.rows.remove(key).map(|r| r.value))
    }

    pub fn values(&self) -> Result<Vec<V>> {
        self.filter(|_| true)
    }

    pub fn filter(&self, pred: impl Fn(&V) -> bool) -> Result<Vec<V>> {
        let inner = self.lock()?;
        Ok(Self::ordered(
            inner.rows.values().filter(|r| pred(&r.value)).collect(),
        ))
    }

    pub fn find(&self, pred: impl Fn(&V) -> bool) -> Result<Option<V>> {
        Ok(self.filter(pred)?.into_iter().next())
    }

    /// Remove every matching row under one lock, returning them in order.
    pub fn remove_where(&self, pred: impl Fn(&V) -> bool) -> Result<Vec<V>> {
        let mut inner = self.lock()?;
        let keys: Vec<K> = inner
            .rows
            .iter()
            .filter(|(_, r)| pred(&r.value))
            .map(|(k, _)| k.clone())
            .collect();
        let mut removed: Vec<Row<V>> = keys
            .iter()
            .filter_map(|k| inner.rows.remove(k))
            .collect();
        removed.sort_by_key(|r| r.seq);
        Ok(removed.into_iter().map(|r| r.value).collect())
    }

    /// Run `f` on the slot for `key` under the lock. Leaving `None` in the
    /// slot removes the row.
    pub fn entry<R>(&self, key: &K, f: impl FnOnce(&mut Option<V>) -> R) -> Result<R> {
        let mut inner = self.lock()?;
        let existing = inner.rows.remove(key);
        let seq = match &existing {
            Some(row) => row.seq,
            None => inner.next_seq,
        };
        let mut slot = existing.map(|r| r.value);
        let result = f(&mut slot);
        if let Some(value) = slot {
            if seq == inner.next_seq {
                inner.next_seq += 1;
            }
            inner.rows.insert(key.clone(), Row { seq, value });
        }
        Ok(result)
    }

    /// Apply `f` to every row; returns the rows for which it reported a change.
    pub fn update_all(&self, mut f: impl FnMut(&mut V) -> bool) -> Result<Vec<V>> {
        let mut inner = self.lock()?;
        let mut changed: Vec<(u64, V)> = Vec::new();
        for row in inner.rows.values_mut() {
            if f(&mut row.value) {
                changed.push((row.seq, row.value.clone()));
            }
        }
        changed.sort_by_key(|(seq, _)| *seq);
        Ok(changed.into_iter().map(|(_, v)| v).collect())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.rows.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn clear(&self) -> Result<usize> {
        let mut inner = self.lock()?;
        let n = inner.rows.len();
        inner.rows.clear();
        Ok(n)
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryNotificationStore {
    pending: KeyedTable<String, Notification>,
    archive: KeyedTable<String, Notification>,
}

#[async_trait]
impl NotificationStore for InMemoryNotificationStore {
    async fn insert(&self, event: Notification) -> Result<()> {
        let id = event.event_id.clone();
        if !self.pending.insert_unique(id.clone(), event)? {
            return Err(AppError::Conflict(format!("notification {id} already queued")));
        }
        Ok(())
    }

    async fn get(&self, event_id: &str) -> Result<Option<Notification>> {
        self.pending.get(&event_id.to_string())
    }

    async fn list_pending(&self) -> Result<Vec<Notification>> {
        let mut events = self.pending.values()?;
        events.sort_by(dequeue_order);
        Ok(events)
    }

    async fn peek_first(&self, now: DateTime<Utc>) -> Result<Option<Notification>> {
        let mut due = self.pending.filter(is_due(now))?;
        due.sort_by(dequeue_order);
        Ok(due.into_iter().next())
    }

    async fn take_due(&self, now: DateTime<Utc>) -> Result<Vec<Notification>> {
        let mut due = self.pending.remove_where(is_due(now))?;
        due.sort_by(dequeue_order);
        Ok(due)
    }

    async fn take(&self, event_id: &str) -> Result<Option<Notification>> {
        self.pending.remove(&event_id.to_string())
    }

    async fn count_pending(&self) -> Result<usize> {
        self.pending.len()
    }

    async fn clear_pending(&self) -> Result<usize> {
        self.pending.clear()
    }

    async fn archive(&self, event: Notification) -> Result<()> {
        self.archive.upsert(event.event_id.clone(), event)
    }

    async fn get_archived(&self, event_id: &str) -> Result<Option<Notification>> {
        self.archive.get(&event_id.to_string())
    }

    async fn list_archived(&self) -> Result<Vec<Notification>> {
        self.archive.values()
    }

    async fn purge_archived_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        Ok(self.archive.remove_where(|n| n.updated < cutoff)?.len())
    }
}

// ---------------------------------------------------------------------------
// Refresh status ledger
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryRefreshStatusStore {
    table: KeyedTable<Gav, RefreshStatus>,
}

#[async_trait]
impl RefreshStatusStore for InMemoryRefreshStatusStore {
    async fn get(&self, key: &Gav) -> Result<Option<RefreshStatus>> {
        self.table.get(key)
    }

    async fn list(&self) -> Result<Vec<RefreshStatus>> {
        self.table.values()
    }

    async fn upsert(&self, status: RefreshStatus) -> Result<()> {
        self.table.upsert(status.key.clone(), status)
    }

    async fn remove(&self, key: &Gav) -> Result<bool> {
        Ok(self.table.remove(key)?.is_some())
    }

    async fn try_acquire(
        &self,
        key: &Gav,
        now: DateTime<Utc>,
        lease: chrono::Duration,
        event_id: Option<&str>,
    ) -> Result<LeaseOutcome<RefreshStatus>> {
        self.table.entry(key, |slot| {
            let status = slot.get_or_insert_with(|| RefreshStatus::new(key.clone()));
            if status.is_active(now) {
                return LeaseOutcome::Held(status.clone());
            }
            status.start(now, lease, event_id.map(String::from));
            LeaseOutcome::Acquired(status.clone())
        })
    }

    async fn release(
        &self,
        key: &Gav,
        event_id: Option<&str>,
        now: DateTime<Utc>,
        response: RefreshResponse,
    ) -> Result<Option<RefreshStatus>> {
        self.table.entry(key, |slot| {
            let status = slot.as_mut()?;
            if !held_by(status, event_id) {
                return None;
            }
            status.finish(now, response);
            Some(status.clone())
        })
    }

    async fn clear_expired(&self, now: DateTime<Utc>) -> Result<Vec<Gav>> {
        let cleared = self.table.update_all(|status| {
            if status.is_abandoned(now) {
                status.running = false;
                status.expires = None;
                status.event_id = None;
                true
            } else {
                false
            }
        })?;
        Ok(cleared.into_iter().map(|s| s.key).collect())
    }
}

// ---------------------------------------------------------------------------
// Version catalog
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryVersionCatalogStore {
    table: KeyedTable<Gav, ProjectVersionData>,
}

#[async_trait]
impl VersionCatalogStore for InMemoryVersionCatalogStore {
    async fn get(&self, gav: &Gav) -> Result<Option<ProjectVersionData>> {
        self.table.get(gav)
    }

    async fn upsert(&self, entry: ProjectVersionData) -> Result<()> {
        self.table.upsert(entry.gav.clone(), entry)
    }

    async fn remove(&self, gav: &Gav) -> Result<Option<ProjectVersionData>> {
        self.table.remove(gav)
    }

    async fn list_versions(
        &self,
        group_id: &str,
        artifact_id: &str,
    ) -> Result<Vec<ProjectVersionData>> {
        self.table.filter(in_project(group_id, artifact_id))
    }

    async fn list_all(&self) -> Result<Vec<ProjectVersionData>> {
        self.table.values()
    }
}

// ---------------------------------------------------------------------------
// Schedule instances
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryScheduleInstanceStore {
    table: KeyedTable<String, ScheduleInstance>,
}

#[async_trait]
impl ScheduleInstanceStore for InMemoryScheduleInstanceStore {
    async fn get(&self, schedule: &str) -> Result<Option<ScheduleInstance>> {
        self.table.get(&schedule.to_string())
    }

    async fn list(&self) -> Result<Vec<ScheduleInstance>> {
        self.table.values()
    }

    async fn try_acquire(
        &self,
        schedule: &str,
        owner: &str,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> Result<LeaseOutcome<ScheduleInstance>> {
        self.table.entry(&schedule.to_string(), |slot| {
            if let Some(instance) = slot.as_ref().filter(|i| i.is_live(now)) {
                return LeaseOutcome::Held(instance.clone());
            }
            let instance = ScheduleInstance {
                schedule: schedule.to_string(),
                owner: owner.to_string(),
                started: now,
                expires: now + lease,
            };
            *slot = Some(instance.clone());
            LeaseOutcome::Acquired(instance)
        })
    }

    async fn release(&self, schedule: &str, owner: &str) -> Result<bool> {
        self.table.entry(&schedule.to_string(), |slot| {
            if slot.as_ref().is_some_and(|i| i.owner == owner) {
                *slot = None;
                true
            } else {
                false
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Checksum ledger
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryArtifactDetailStore {
    table: KeyedTable<String, ArtifactDetail>,
}

#[async_trait]
impl ArtifactDetailStore for InMemoryArtifactDetailStore {
    async fn get(&self, path: &str) -> Result<Option<ArtifactDetail>> {
        self.table.get(&path.to_string())
    }

    async fn upsert(&self, detail: ArtifactDetail) -> Result<()> {
        self.table.upsert(detail.path.clone(), detail)
    }

    async fn list_for_version(&self, gav: &Gav) -> Result<Vec<ArtifactDetail>> {
        self.table.filter(owned_by(gav))
    }

    async fn remove_for_version(&self, gav: &Gav) -> Result<usize> {
        Ok(self.table.remove_where(owned_by(gav))?.len())
    }
}

// ---------------------------------------------------------------------------
// Projects
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryProjectStore {
    table: KeyedTable<String, ProjectCoordinates>,
}

#[async_trait]
impl ProjectStore for InMemoryProjectStore {
    async fn upsert(&self, project: ProjectCoordinates) -> Result<()> {
        let clash = self.table.find(|p| {
            p.project_id != project.project_id
                && p.group_id == project.group_id
                && p.artifact_id == project.artifact_id
        })?;
        if let Some(other) = clash {
            return Err(AppError::Conflict(format!(
                "{}:{} is already registered as project {}",
                project.group_id, project.artifact_id, other.project_id
            )));
        }
        self.table.upsert(project.project_id.clone(), project)
    }

    async fn get(&self, project_id: &str) -> Result<Option<ProjectCoordinates>> {
        self.table.get(&project_id.to_string())
    }

    async fn find_by_coordinates(
        &self,
        group_id: &str,
        artifact_id: &str,
    ) -> Result<Option<ProjectCoordinates>> {
        self.table
            .find(|p| p.group_id == group_id && p.artifact_id == artifact_id)
    }

    async fn list(&self) -> Result<Vec<ProjectCoordinates>> {
        self.table.values()
    }

    async fn remove(&self, project_id: &str) -> Result<bool> {
        Ok(self.table.remove(&project_id.to_string())?.is_some())
    }
}

// ---------------------------------------------------------------------------
// Key filters
// ---------------------------------------------------------------------------

/// Higher priority first, then oldest first.
fn dequeue_order(a: &Notification, b: &Notification) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.created.cmp(&b.created))
}

fn is_due(now: DateTime<Utc>) -> impl Fn(&Notification) -> bool {
    move |n| n.is_due(now)
}

fn in_project<'a>(group_id: &'a str, artifact_id: &'a str) -> impl Fn(&ProjectVersionData) -> bool + 'a {
    move |v| v.gav.same_project(group_id, artifact_id)
}

fn owned_by(gav: &Gav) -> impl Fn(&ArtifactDetail) -> bool + '_ {
    move |d| &d.gav == gav
}

fn held_by(status: &RefreshStatus, event_id: Option<&str>) -> bool {
    match (status.event_id.as_deref(), event_id) {
        (Some(holder), Some(caller)) => holder == caller,
        _ => true,
    }
}
