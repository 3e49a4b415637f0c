//! Notification queue.
//!
//! At-least-once work queue over a [`NotificationStore`]. Higher priority
//! events are dequeued first, FIFO within a priority band. Finished events are
//! moved to an audit archive instead of being dropped, so terminal failures
//! stay queryable.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Notification, NotificationStatus};
use crate::services::metrics_service::MetricsSink;
use crate::storage::NotificationStore;

/// Filter over archived notifications. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub group_id: Option<String>,
    pub artifact_id: Option<String>,
    pub version_id: Option<String>,
    pub status: Option<NotificationStatus>,
    pub parent_event_id: Option<String>,
}

impl HistoryFilter {
    fn matches(&self, n: &Notification) -> bool {
        fn field(want: &Option<String>, have: &str) -> bool {
            want.as_deref().map_or(true, |w| w == have)
        }
        field(&self.group_id, &n.group_id)
            && field(&self.artifact_id, &n.artifact_id)
            && field(&self.version_id, &n.version_id)
            && self.status.map_or(true, |s| s == n.status)
            && self
                .parent_event_id
                .as_deref()
                .map_or(true, |p| n.parent_event_id.as_deref() == Some(p))
    }
}

pub struct NotificationQueue {
    store: Arc<dyn NotificationStore>,
    metrics: Arc<dyn MetricsSink>,
}

impl NotificationQueue {
    pub fn new(store: Arc<dyn NotificationStore>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self { store, metrics }
    }

    /// Validate and enqueue, assigning an event id when the event has none.
    pub async fn push(&self, mut event: Notification) -> Result<String> {
        event.validate()?;
        if event.event_id.trim().is_empty() {
            event.event_id = Uuid::new_v4().to_string();
        }
        event.status = NotificationStatus::Pending;
        event.updated = Utc::now();

        let id = event.event_id.clone();
        tracing::debug!(
            event_id = %id,
            action = event.action.as_str(),
            group_id = %event.group_id,
            artifact_id = %event.artifact_id,
            version_id = %event.version_id,
            "Notification queued"
        );
        self.store.insert(event).await?;
        self.report_depth().await;
        Ok(id)
    }

    /// Put an event back under its existing id, not to be picked up before
    /// `delay` has passed.
    pub async fn requeue(&self, mut event: Notification, delay: Duration) -> Result<()> {
        let now = Utc::now();
        event.status = NotificationStatus::Pending;
        event.updated = now;
        let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        event.not_before = Some(now + delay);
        self.store.insert(event).await?;
        self.report_depth().await;
        Ok(())
    }

    /// First due event, left in the queue.
    pub async fn peek_first(&self) -> Result<Option<Notification>> {
        self.store.peek_first(Utc::now()).await
    }

    /// Remove and return every due event.
    pub async fn pull_all(&self) -> Result<Vec<Notification>> {
        let events = self.store.take_due(Utc::now()).await?;
        self.report_depth().await;
        Ok(events)
    }

    /// Remove one event by id. `None` when another consumer already took it.
    pub async fn claim(&self, event_id: &str) -> Result<Option<Notification>> {
        self.store.take(event_id).await
    }

    /// Look an event up in the active queue, then in the archive.
    pub async fn get(&self, event_id: &str) -> Result<Option<Notification>> {
        match self.store.get(event_id).await? {
            Some(event) => Ok(Some(event)),
            None => self.store.get_archived(event_id).await,
        }
    }

    /// Active events in dequeue order.
    pub async fn get_all(&self) -> Result<Vec<Notification>> {
        self.store.list_pending().await
    }

    pub async fn size(&self) -> Result<usize> {
        self.store.count_pending().await
    }

    pub async fn delete_all(&self) -> Result<usize> {
        let n = self.store.clear_pending().await?;
        self.report_depth().await;
        Ok(n)
    }

    /// Archive a successfully processed event.
    pub async fn complete(&self, event: Notification) -> Result<()> {
        self.finish(event, NotificationStatus::Completed).await
    }

    /// Archive a terminally failed event, keeping its accumulated errors.
    pub async fn fail(&self, event: Notification) -> Result<()> {
        self.finish(event, NotificationStatus::Failed).await
    }

    async fn finish(&self, mut event: Notification, status: NotificationStatus) -> Result<()> {
        let now = Utc::now();
        event.status = status;
        event.updated = now;
        event.completed = Some(now);
        event.not_before = None;
        self.store.archive(event).await
    }

    /// Archived events matching `filter`.
    pub async fn history(&self, filter: &HistoryFilter) -> Result<Vec<Notification>> {
        Ok(self
            .store
            .list_archived()
            .await?
            .into_iter()
            .filter(|n| filter.matches(n))
            .collect())
    }

    /// Every event, queued or archived, cascaded from `parent_event_id`.
    pub async fn children_of(&self, parent_event_id: &str) -> Result<Vec<Notification>> {
        let is_child = |n: &Notification| n.parent_event_id.as_deref() == Some(parent_event_id);
        let mut children: Vec<Notification> = self
            .store
            .list_pending()
            .await?
            .into_iter()
            .filter(|n| is_child(n))
            .collect();
        children.extend(
            self.store
                .list_archived()
                .await?
                .into_iter()
                .filter(|n| is_child(n)),
        );
        Ok(children)
    }

    /// Drop archived events last touched more than `ttl` ago.
    pub async fn purge_archived_older_than(&self, ttl: chrono::Duration) -> Result<usize> {
        self.purge_archived_before(Utc::now() - ttl).await
    }

    pub async fn purge_archived_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let purged = self.store.purge_archived_before(cutoff).await?;
        if purged > 0 {
            tracing::info!("Purged {} archived notification(s)", purged);
        }
        Ok(purged)
    }

    async fn report_depth(&self) {
        match self.store.count_pending().await {
            Ok(depth) => self.metrics.record_queue_depth(depth),
            Err(e) => tracing::warn!("Failed to read queue depth: {}", e),
        }
    }
}
