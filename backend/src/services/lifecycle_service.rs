//! Eviction and retention policies for the version catalog.
//!
//! Policies select candidates from the catalog and evict them one by one.
//! Every eviction takes the version's refresh lease first, so a version with a
//! refresh in flight is deferred to a later pass rather than evicted under the
//! running worker.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::models::version::compare_versions;
use crate::models::{Gav, ProjectVersionData};
use crate::services::artifact_handler::ArtifactHandler;
use crate::services::metrics_service::MetricsSink;
use crate::services::query_metrics::QueryMetricsSource;
use crate::services::refresh_ledger::RefreshLedger;
use crate::services::repository_client::ArtifactRepository;
use crate::storage::{ArtifactDetailStore, LeaseOutcome, VersionCatalogStore};

/// Lease holder recorded on the ledger while an eviction runs.
const EVICTION_HOLDER: &str = "eviction";

/// A retention rule over the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Release versions not updated within `days`
    VersionTtl { days: i64 },
    /// Snapshot versions not updated within `days`, except the newest one
    SnapshotTtl { days: i64 },
    /// At most `keep` snapshot versions per artifact, newest kept
    MaxSnapshots { keep: usize },
    /// Release versions not queried within `days`
    LeastRecentlyUsed { days: i64 },
    /// Only the newest `keep` release versions per artifact
    KeepNewest { keep: usize },
}

impl RetentionPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            RetentionPolicy::VersionTtl { .. } => "version_ttl",
            RetentionPolicy::SnapshotTtl { .. } => "snapshot_ttl",
            RetentionPolicy::MaxSnapshots { .. } => "max_snapshots",
            RetentionPolicy::LeastRecentlyUsed { .. } => "least_recently_used",
            RetentionPolicy::KeepNewest { .. } => "keep_newest",
        }
    }

    pub fn validate(&self) -> Result<()> {
        match *self {
            RetentionPolicy::VersionTtl { days }
            | RetentionPolicy::SnapshotTtl { days }
            | RetentionPolicy::LeastRecentlyUsed { days } => {
                if days <= 0 {
                    return Err(AppError::Validation(format!(
                        "{} requires a positive number of days",
                        self.name()
                    )));
                }
            }
            RetentionPolicy::MaxSnapshots { keep } | RetentionPolicy::KeepNewest { keep } => {
                if keep == 0 {
                    return Err(AppError::Validation(format!(
                        "{} requires keeping at least one version",
                        self.name()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Result of one policy run (or dry run).
#[derive(Debug, Clone, Serialize)]
pub struct RetentionReport {
    pub policy: String,
    pub dry_run: bool,
    pub matched: Vec<Gav>,
    pub evicted: Vec<Gav>,
    /// Candidates skipped because a refresh held their lease
    pub deferred: Vec<Gav>,
    pub errors: Vec<String>,
}

impl RetentionReport {
    fn new(policy: &RetentionPolicy, dry_run: bool) -> Self {
        Self {
            policy: policy.name().to_string(),
            dry_run,
            matched: Vec::new(),
            evicted: Vec::new(),
            deferred: Vec::new(),
            errors: Vec::new(),
        }
    }
}

/// What happened to a single eviction or delete request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionOutcome {
    Evicted,
    Deleted,
    /// A refresh holds the version's lease; try again later
    Deferred,
    /// Nothing cached for the version
    NotCached,
}

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub version_ttl_days: i64,
    pub snapshot_ttl_days: i64,
    pub max_snapshots_allowed: usize,
    pub lru_days: i64,
    pub keep_versions: usize,
    pub head_snapshot_version: String,
}

impl From<&Config> for LifecycleSettings {
    fn from(config: &Config) -> Self {
        Self {
            version_ttl_days: config.version_ttl_days,
            snapshot_ttl_days: config.snapshot_ttl_days,
            max_snapshots_allowed: config.max_snapshots_allowed,
            lru_days: config.lru_days,
            keep_versions: config.keep_versions,
            head_snapshot_version: config.head_snapshot_version.clone(),
        }
    }
}

impl LifecycleSettings {
    /// Policies run by the scheduled job. A zero setting disables its policy.
    pub fn configured_policies(&self) -> Vec<RetentionPolicy> {
        let mut policies = Vec::new();
        if self.version_ttl_days > 0 {
            policies.push(RetentionPolicy::VersionTtl { days: self.version_ttl_days });
        }
        if self.snapshot_ttl_days > 0 {
            policies.push(RetentionPolicy::SnapshotTtl { days: self.snapshot_ttl_days });
        }
        if self.max_snapshots_allowed > 0 {
            policies.push(RetentionPolicy::MaxSnapshots { keep: self.max_snapshots_allowed });
        }
        if self.lru_days > 0 {
            policies.push(RetentionPolicy::LeastRecentlyUsed { days: self.lru_days });
        }
        if self.keep_versions > 0 {
            policies.push(RetentionPolicy::KeepNewest { keep: self.keep_versions });
        }
        policies
    }
}

pub struct LifecycleService {
    catalog: Arc<dyn VersionCatalogStore>,
    artifact_details: Arc<dyn ArtifactDetailStore>,
    ledger: Arc<RefreshLedger>,
    repository: Arc<dyn ArtifactRepository>,
    handler: Arc<dyn ArtifactHandler>,
    query_metrics: Arc<dyn QueryMetricsSource>,
    metrics: Arc<dyn MetricsSink>,
    settings: LifecycleSettings,
}

impl LifecycleService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        catalog: Arc<dyn VersionCatalogStore>,
        artifact_details: Arc<dyn ArtifactDetailStore>,
        ledger: Arc<RefreshLedger>,
        repository: Arc<dyn ArtifactRepository>,
        handler: Arc<dyn ArtifactHandler>,
        query_metrics: Arc<dyn QueryMetricsSource>,
        metrics: Arc<dyn MetricsSink>,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            catalog,
            artifact_details,
            ledger,
            repository,
            handler,
            query_metrics,
            metrics,
            settings,
        }
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    /// Execute a policy (dry_run=true previews without evicting).
    pub async fn execute_policy(
        &self,
        policy: RetentionPolicy,
        dry_run: bool,
    ) -> Result<RetentionReport> {
        policy.validate()?;
        let candidates = self.candidates(&policy, Utc::now()).await?;

        let mut report = RetentionReport::new(&policy, dry_run);
        report.matched = candidates.clone();
        if dry_run {
            return Ok(report);
        }

        for gav in candidates {
            match self.evict_version(&gav).await {
                Ok(EvictionOutcome::Evicted) | Ok(EvictionOutcome::Deleted) => {
                    report.evicted.push(gav)
                }
                Ok(EvictionOutcome::Deferred) => {
                    tracing::debug!("Eviction of {} deferred: refresh in flight", gav);
                    report.deferred.push(gav)
                }
                Ok(EvictionOutcome::NotCached) => {}
                Err(e) => {
                    tracing::warn!("Failed to evict {} under {}: {}", gav, policy.name(), e);
                    report.errors.push(format!("{gav}: {e}"));
                }
            }
        }

        if !report.evicted.is_empty() {
            tracing::info!(
                "Retention policy '{}' evicted {} version(s), deferred {}",
                report.policy,
                report.evicted.len(),
                report.deferred.len()
            );
            self.metrics
                .record_eviction(policy.name(), report.evicted.len() as u64);
        }
        Ok(report)
    }

    /// Execute every configured policy (called by the scheduled job).
    pub async fn execute_all_configured(&self) -> Vec<RetentionReport> {
        let mut reports = Vec::new();
        for policy in self.settings.configured_policies() {
            match self.execute_policy(policy, false).await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    tracing::error!("Failed to execute retention policy '{}': {}", policy.name(), e);
                    let mut report = RetentionReport::new(&policy, false);
                    report.errors.push(e.to_string());
                    reports.push(report);
                }
            }
        }
        reports
    }

    /// Evict release versions not queried within `days`.
    pub async fn retire_least_recently_used(&self, days: i64) -> Result<RetentionReport> {
        self.execute_policy(RetentionPolicy::LeastRecentlyUsed { days }, false)
            .await
    }

    /// Evict all but the newest `keep` release versions of every artifact.
    pub async fn retire_oldest(&self, keep: usize) -> Result<RetentionReport> {
        self.execute_policy(RetentionPolicy::KeepNewest { keep }, false)
            .await
    }

    /// Soft-delete one version, unless a refresh holds its lease.
    pub async fn evict_version(&self, gav: &Gav) -> Result<EvictionOutcome> {
        self.guarded(gav, false).await
    }

    /// Hard-delete one version, unless a refresh holds its lease.
    pub async fn delete_version(&self, gav: &Gav) -> Result<EvictionOutcome> {
        self.guarded(gav, true).await
    }

    /// Flag a cached version as deprecated. Returns whether an entry was flagged.
    pub async fn deprecate_version(&self, gav: &Gav) -> Result<bool> {
        match self.catalog.get(gav).await? {
            Some(mut entry) if !entry.deprecated => {
                entry.deprecated = true;
                entry.updated = Utc::now();
                self.catalog.upsert(entry).await?;
                tracing::info!("Deprecated {}", gav);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Flag cached release versions the repository no longer lists.
    ///
    /// Flagging only: a repository outage must never cause data loss.
    pub async fn deprecate_versions_not_in_repository(
        &self,
        group_id: &str,
        artifact_id: &str,
    ) -> Result<Vec<Gav>> {
        let published: HashSet<String> = self
            .repository
            .find_versions(group_id, artifact_id)
            .await?
            .into_iter()
            .collect();

        let mut flagged = Vec::new();
        for entry in self.catalog.list_versions(group_id, artifact_id).await? {
            if entry.evicted || entry.is_snapshot() || published.contains(&entry.gav.version_id) {
                continue;
            }
            if self.deprecate_version(&entry.gav).await? {
                flagged.push(entry.gav);
            }
        }
        Ok(flagged)
    }

    async fn guarded(&self, gav: &Gav, hard: bool) -> Result<EvictionOutcome> {
        let scope = Gav::all_versions(&gav.group_id, &gav.artifact_id);
        let now = Utc::now();
        if self.ledger.get(&scope).await?.is_some_and(|s| s.is_active(now)) {
            return Ok(EvictionOutcome::Deferred);
        }
        if let LeaseOutcome::Held(_) = self.ledger.try_acquire(gav, Some(EVICTION_HOLDER)).await? {
            return Ok(EvictionOutcome::Deferred);
        }

        let result = self.apply(gav, hard).await;
        self.ledger.remove(gav).await?;
        result
    }

    async fn apply(&self, gav: &Gav, hard: bool) -> Result<EvictionOutcome> {
        let Some(mut entry) = self.catalog.get(gav).await? else {
            self.artifact_details.remove_for_version(gav).await?;
            return Ok(EvictionOutcome::NotCached);
        };

        let response = self.handler.delete(gav).await?;
        for error in &response.errors {
            tracing::warn!("Handler reported an error removing {}: {}", gav, error);
        }
        self.artifact_details.remove_for_version(gav).await?;

        if hard {
            self.catalog.remove(gav).await?;
            tracing::info!("Deleted {}", gav);
            Ok(EvictionOutcome::Deleted)
        } else {
            entry.evicted = true;
            entry.updated = Utc::now();
            self.catalog.upsert(entry).await?;
            tracing::info!("Evicted {}", gav);
            Ok(EvictionOutcome::Evicted)
        }
    }

    // --- Candidate selection ---

    async fn candidates(&self, policy: &RetentionPolicy, now: DateTime<Utc>) -> Result<Vec<Gav>> {
        let live: Vec<ProjectVersionData> = self
            .catalog
            .list_all()
            .await?
            .into_iter()
            .filter(|e| !e.evicted)
            .collect();
        let head = self.settings.head_snapshot_version.as_str();

        let selected = match *policy {
            RetentionPolicy::VersionTtl { days } => {
                let cutoff = now - chrono::Duration::days(days);
                live.iter()
                    .filter(|e| !e.is_snapshot() && e.updated < cutoff)
                    .map(|e| e.gav.clone())
                    .collect()
            }
            RetentionPolicy::SnapshotTtl { days } => {
                let cutoff = now - chrono::Duration::days(days);
                let mut selected = Vec::new();
                for entries in by_project(live.iter().filter(|e| e.is_snapshot())).into_values() {
                    let newest = entries
                        .iter()
                        .max_by(|a, b| a.updated.cmp(&b.updated).then(a.created.cmp(&b.created)))
                        .map(|e| e.gav.clone());
                    selected.extend(
                        entries
                            .into_iter()
                            .filter(|e| e.updated < cutoff && e.gav.version_id != head)
                            .filter(|e| Some(&e.gav) != newest.as_ref())
                            .map(|e| e.gav.clone()),
                    );
                }
                selected
            }
            RetentionPolicy::MaxSnapshots { keep } => {
                let mut selected = Vec::new();
                // The head snapshot does not count against the cap
                let branches = live
                    .iter()
                    .filter(|e| e.is_snapshot() && e.gav.version_id != head);
                for mut entries in by_project(branches).into_values() {
                    entries.sort_by(|a, b| latest_publish_first(a, b));
                    selected.extend(entries.into_iter().skip(keep).map(|e| e.gav.clone()));
                }
                selected
            }
            RetentionPolicy::LeastRecentlyUsed { days } => {
                let cutoff = now - chrono::Duration::days(days);
                let mut stale = Vec::new();
                for entry in live.iter().filter(|e| !e.is_snapshot()) {
                    let last_used = self
                        .query_metrics
                        .last_queried(&entry.gav)
                        .await
                        .unwrap_or(entry.created);
                    if last_used < cutoff {
                        stale.push((last_used, entry.gav.clone()));
                    }
                }
                stale.sort_by(|a, b| a.0.cmp(&b.0));
                stale.into_iter().map(|(_, gav)| gav).collect()
            }
            RetentionPolicy::KeepNewest { keep } => {
                let mut selected = Vec::new();
                for mut entries in by_project(live.iter().filter(|e| !e.is_snapshot())).into_values() {
                    entries.sort_by(|a, b| highest_version_first(a, b));
                    let mut evict: Vec<Gav> =
                        entries.into_iter().skip(keep).map(|e| e.gav.clone()).collect();
                    // Oldest first
                    evict.reverse();
                    selected.extend(evict);
                }
                selected
            }
        };
        Ok(selected)
    }
}

fn by_project<'a>(
    entries: impl Iterator<Item = &'a ProjectVersionData>,
) -> BTreeMap<(String, String), Vec<&'a ProjectVersionData>> {
    let mut grouped: BTreeMap<(String, String), Vec<&'a ProjectVersionData>> = BTreeMap::new();
    for entry in entries {
        grouped.entry(entry.gav.project_key()).or_default().push(entry);
    }
    grouped
}

/// Releases rank by version alone; cache order says nothing about release order.
fn highest_version_first(a: &ProjectVersionData, b: &ProjectVersionData) -> Ordering {
    compare_versions(&b.gav.version_id, &a.gav.version_id)
}

/// Snapshots rank by their last publish. `created` only records the first cache.
fn latest_publish_first(a: &ProjectVersionData, b: &ProjectVersionData) -> Ordering {
    b.updated
        .cmp(&a.updated)
        .then_with(|| compare_versions(&b.gav.version_id, &a.gav.version_id))
}
