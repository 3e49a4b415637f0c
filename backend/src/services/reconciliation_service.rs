//! Reconciliation between the repository and the cache catalog.
//!
//! For every known project the repository's published release list is diffed
//! against the cached, non-evicted releases. Versions missing from the cache
//! get a refresh queued; versions missing from the repository get a
//! deprecation queued. Nothing is ever hard-deleted from here.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::error::{AppError, Result};
use crate::models::version::{is_snapshot, sort_versions};
use crate::models::{ProjectCoordinates, VersionMismatch};
use crate::services::metrics_service::MetricsSink;
use crate::services::refresh_service::{RefreshOptions, RefreshService};
use crate::services::repository_client::ArtifactRepository;
use crate::storage::{ProjectStore, VersionCatalogStore};

/// Mismatches found by one run, plus the corrective events it queued.
#[derive(Debug, Clone, Default)]
pub struct ReconciliationReport {
    pub mismatches: Vec<VersionMismatch>,
    pub refresh_event_ids: Vec<String>,
    pub deprecate_event_ids: Vec<String>,
    pub errors: Vec<String>,
}

pub struct ReconciliationService {
    projects: Arc<dyn ProjectStore>,
    catalog: Arc<dyn VersionCatalogStore>,
    repository: Arc<dyn ArtifactRepository>,
    refresh: Arc<RefreshService>,
    metrics: Arc<dyn MetricsSink>,
    concurrency: usize,
}

impl ReconciliationService {
    pub fn new(
        projects: Arc<dyn ProjectStore>,
        catalog: Arc<dyn VersionCatalogStore>,
        repository: Arc<dyn ArtifactRepository>,
        refresh: Arc<RefreshService>,
        metrics: Arc<dyn MetricsSink>,
        concurrency: usize,
    ) -> Self {
        Self {
            projects,
            catalog,
            repository,
            refresh,
            metrics,
            concurrency: concurrency.max(1),
        }
    }

    /// Diff every known project. Only projects with drift or an error are
    /// returned; nothing is queued.
    pub async fn find_version_mismatches(&self) -> Result<Vec<VersionMismatch>> {
        let projects = self.projects.list().await?;
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        for project in projects {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| AppError::Internal(format!("reconciliation pool closed: {e}")))?;
            let repository = self.repository.clone();
            let catalog = self.catalog.clone();
            tasks.spawn(async move {
                let _permit = permit;
                diff_project(repository.as_ref(), catalog.as_ref(), &project).await
            });
        }

        let mut mismatches = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(mismatch) if mismatch.is_reportable() => mismatches.push(mismatch),
                Ok(_) => {}
                Err(e) => tracing::error!("Reconciliation task aborted: {e}"),
            }
        }
        mismatches.sort_by(|a, b| a.project_id.cmp(&b.project_id));

        self.metrics
            .record_mismatches(mismatches.iter().filter(|m| m.has_drift()).count() as u64);
        Ok(mismatches)
    }

    /// Diff a single project.
    pub async fn reconcile_project(&self, project: &ProjectCoordinates) -> VersionMismatch {
        diff_project(self.repository.as_ref(), self.catalog.as_ref(), project).await
    }

    /// Diff every project and queue the corrective events.
    pub async fn reconcile(&self) -> Result<ReconciliationReport> {
        let mut report = ReconciliationReport {
            mismatches: self.find_version_mismatches().await?,
            ..Default::default()
        };

        for mismatch in &report.mismatches {
            let project = ProjectCoordinates::new(
                &mismatch.project_id,
                &mismatch.group_id,
                &mismatch.artifact_id,
            );
            for version in &mismatch.versions_not_in_cache {
                let gav = project.version(version);
                match self.refresh.refresh_version(&gav, RefreshOptions::default()).await {
                    Ok(id) => report.refresh_event_ids.push(id),
                    Err(e) => report.errors.push(format!("{gav}: {e}")),
                }
            }
            for version in &mismatch.versions_not_in_repo {
                let gav = project.version(version);
                let already_flagged = match self.catalog.get(&gav).await {
                    Ok(entry) => entry.is_some_and(|e| e.deprecated),
                    Err(e) => {
                        report.errors.push(format!("{gav}: {e}"));
                        continue;
                    }
                };
                if already_flagged {
                    continue;
                }
                match self.refresh.deprecate_version(&gav).await {
                    Ok(id) => report.deprecate_event_ids.push(id),
                    Err(e) => report.errors.push(format!("{gav}: {e}")),
                }
            }
        }

        tracing::info!(
            "Reconciliation: {} project(s) out of sync, queued {} refresh(es) and {} deprecation(s)",
            report.mismatches.iter().filter(|m| m.has_drift()).count(),
            report.refresh_event_ids.len(),
            report.deprecate_event_ids.len()
        );
        Ok(report)
    }
}

/// Compare repository releases with cached, non-evicted releases. Errors are
/// captured on the report rather than returned.
async fn diff_project(
    repository: &dyn ArtifactRepository,
    catalog: &dyn VersionCatalogStore,
    project: &ProjectCoordinates,
) -> VersionMismatch {
    let mut mismatch = VersionMismatch {
        project_id: project.project_id.clone(),
        group_id: project.group_id.clone(),
        artifact_id: project.artifact_id.clone(),
        ..Default::default()
    };

    let published: BTreeSet<String> = match repository
        .find_versions(&project.group_id, &project.artifact_id)
        .await
    {
        Ok(versions) => versions.into_iter().filter(|v| !is_snapshot(v)).collect(),
        Err(e) => {
            tracing::warn!(
                "Repository lookup for {}:{} failed: {}",
                project.group_id,
                project.artifact_id,
                e
            );
            mismatch.errors.push(e.to_string());
            return mismatch;
        }
    };

    let cached: HashSet<String> = match catalog
        .list_versions(&project.group_id, &project.artifact_id)
        .await
    {
        Ok(entries) => entries
            .into_iter()
            .filter(|e| !e.evicted && !e.is_snapshot())
            .map(|e| e.gav.version_id)
            .collect(),
        Err(e) => {
            mismatch.errors.push(e.to_string());
            return mismatch;
        }
    };

    mismatch.versions_not_in_cache = published
        .iter()
        .filter(|v| !cached.contains(*v))
        .cloned()
        .collect();
    mismatch.versions_not_in_repo = cached
        .into_iter()
        .filter(|v| !published.contains(v))
        .collect();
    sort_versions(&mut mismatch.versions_not_in_cache);
    sort_versions(&mut mismatch.versions_not_in_repo);
    mismatch
}
