//! Refresh status ledger.
//!
//! Per-key lease that keeps at most one refresh of a given
//! `(group, artifact, version)` in flight. The lease is time-bounded: a
//! record left `running` by a crashed worker stops counting once its
//! `expires` passes, and the next attempt takes it over.

use chrono::Utc;
use std::sync::Arc;

use crate::error::Result;
use crate::models::{Gav, RefreshResponse, RefreshStatus};
use crate::storage::{LeaseOutcome, RefreshStatusStore};

pub struct RefreshLedger {
    store: Arc<dyn RefreshStatusStore>,
    lease: chrono::Duration,
}

impl RefreshLedger {
    pub fn new(store: Arc<dyn RefreshStatusStore>, lease: chrono::Duration) -> Self {
        Self { store, lease }
    }

    pub fn lease(&self) -> chrono::Duration {
        self.lease
    }

    /// Take the lease on `key` for `event_id`.
    pub async fn try_acquire(
        &self,
        key: &Gav,
        event_id: Option<&str>,
    ) -> Result<LeaseOutcome<RefreshStatus>> {
        let outcome = self
            .store
            .try_acquire(key, Utc::now(), self.lease, event_id)
            .await?;
        if let LeaseOutcome::Held(status) = &outcome {
            tracing::debug!(
                key = %key,
                holder = status.event_id.as_deref().unwrap_or("-"),
                "Refresh lease held elsewhere"
            );
        }
        Ok(outcome)
    }

    /// Release the lease and record the run's outcome.
    pub async fn release(
        &self,
        key: &Gav,
        event_id: Option<&str>,
        response: RefreshResponse,
    ) -> Result<Option<RefreshStatus>> {
        let released = self
            .store
            .release(key, event_id, Utc::now(), response)
            .await?;
        if released.is_none() {
            tracing::warn!(key = %key, "Refresh lease was lost before release");
        }
        Ok(released)
    }

    pub async fn get(&self, key: &Gav) -> Result<Option<RefreshStatus>> {
        self.store.get(key).await
    }

    pub async fn list(&self) -> Result<Vec<RefreshStatus>> {
        self.store.list().await
    }

    /// Records holding a live lease.
    pub async fn list_running(&self) -> Result<Vec<RefreshStatus>> {
        let now = Utc::now();
        Ok(self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|s| s.is_active(now))
            .collect())
    }

    /// Whether `gav` (or its all-versions scope) has a refresh in flight.
    pub async fn is_running(&self, gav: &Gav) -> Result<bool> {
        let now = Utc::now();
        if self.store.get(gav).await?.is_some_and(|s| s.is_active(now)) {
            return Ok(true);
        }
        let scope = Gav::all_versions(&gav.group_id, &gav.artifact_id);
        if scope == *gav {
            return Ok(false);
        }
        Ok(self.store.get(&scope).await?.is_some_and(|s| s.is_active(now)))
    }

    pub async fn remove(&self, key: &Gav) -> Result<bool> {
        self.store.remove(key).await
    }

    /// Reset records abandoned by crashed workers.
    pub async fn clear_expired(&self) -> Result<Vec<Gav>> {
        let cleared = self.store.clear_expired(Utc::now()).await?;
        for key in &cleared {
            tracing::info!(key = %key, "Cleared abandoned refresh lease");
        }
        Ok(cleared)
    }
}
