//! Refresh orchestrator.
//!
//! Consumes the notification queue. For each event it takes the per-key
//! refresh lease, drives the artifact handler, records the outcome on the
//! ledger and the catalog, and either completes, retries or fails the event.
//! Catalog actions (evict, delete, deprecate) skip the handler and go through
//! the lifecycle service, which applies the same lease check.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::Config;
use crate::error::{AppError, ErrorKind, Result};
use crate::models::{
    ArtifactDetail, ArtifactFile, BatchResponse, Gav, Notification, NotificationAction,
    NotificationResponse, ParentEvent, ProjectVersionData, RefreshResponse,
};
use crate::services::lifecycle_service::{EvictionOutcome, LifecycleService};
use crate::services::metrics_service::MetricsSink;
use crate::services::notification_queue::NotificationQueue;
use crate::services::refresh_ledger::RefreshLedger;
use crate::services::Collaborators;
use crate::storage::{
    ArtifactDetailStore, LeaseOutcome, ProjectStore, Stores, VersionCatalogStore,
};

/// Upper bound on the retry delay, whatever the base and attempt.
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// What processing a notification led to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Handler ran and the event is archived as completed
    Succeeded,
    /// Content unchanged since the last run; completed without the handler
    Skipped,
    /// Another worker holds the key; requeued without consuming an attempt
    Deferred,
    /// Attempt failed and the event was requeued with backoff
    Retried,
    /// Terminal failure, archived with its accumulated errors
    Failed,
}

impl ProcessOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessOutcome::Succeeded => "succeeded",
            ProcessOutcome::Skipped => "skipped",
            ProcessOutcome::Deferred => "deferred",
            ProcessOutcome::Retried => "retried",
            ProcessOutcome::Failed => "failed",
        }
    }
}

/// Options for the enqueueing entry points.
#[derive(Debug, Clone, Default)]
pub struct RefreshOptions {
    pub full_update: bool,
    pub transitive: bool,
    pub parent_event_id: Option<String>,
    pub priority: i32,
}

/// Event ids queued by a batch entry point, plus per-item errors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueReport {
    pub event_ids: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RefreshSettings {
    pub max_attempts: u32,
    pub handler_timeout: Duration,
    /// Bound on a whole leased run: file fetch, handler and child pushes
    pub run_timeout: Duration,
    pub retry_backoff_base: Duration,
    pub defer_delay: Duration,
    pub concurrency: usize,
    pub artifact_types: Vec<String>,
    pub head_snapshot_version: String,
}

impl From<&Config> for RefreshSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_attempts: config.max_attempts,
            handler_timeout: config.handler_timeout,
            run_timeout: config.run_timeout(),
            retry_backoff_base: config.retry_backoff_base,
            defer_delay: config.defer_delay,
            concurrency: config.worker_concurrency,
            artifact_types: config.artifact_types.clone(),
            head_snapshot_version: config.head_snapshot_version.clone(),
        }
    }
}

/// Delay before retry number `attempt` (1-based): base doubled per attempt,
/// capped at five minutes.
pub fn calculate_backoff(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor).min(MAX_BACKOFF)
}

/// Result of one unit of work before it is turned into an outcome.
struct RunResult {
    response: RefreshResponse,
    skipped: bool,
}

pub struct RefreshService {
    queue: Arc<NotificationQueue>,
    ledger: Arc<RefreshLedger>,
    lifecycle: Arc<LifecycleService>,
    catalog: Arc<dyn VersionCatalogStore>,
    artifact_details: Arc<dyn ArtifactDetailStore>,
    projects: Arc<dyn ProjectStore>,
    collaborators: Collaborators,
    metrics: Arc<dyn MetricsSink>,
    settings: RefreshSettings,
}

impl RefreshService {
    pub fn new(
        queue: Arc<NotificationQueue>,
        ledger: Arc<RefreshLedger>,
        lifecycle: Arc<LifecycleService>,
        stores: &Stores,
        collaborators: Collaborators,
        metrics: Arc<dyn MetricsSink>,
        settings: RefreshSettings,
    ) -> Self {
        Self {
            queue,
            ledger,
            lifecycle,
            catalog: stores.catalog.clone(),
            artifact_details: stores.artifact_details.clone(),
            projects: stores.projects.clone(),
            collaborators,
            metrics,
            settings,
        }
    }

    pub fn settings(&self) -> &RefreshSettings {
        &self.settings
    }

    // --- Enqueueing entry points ---

    /// Queue a refresh of one version.
    pub async fn refresh_version(&self, gav: &Gav, options: RefreshOptions) -> Result<String> {
        gav.validate()?;
        let parent = ParentEvent::resolve(gav, options.parent_event_id.as_deref());
        let event = self
            .with_project(Notification::refresh(gav, self.settings.max_attempts), gav)
            .await?
            .with_parent(parent)
            .with_full_update(options.full_update)
            .with_transitive(options.transitive)
            .with_priority(options.priority);
        self.queue.push(event).await
    }

    /// Queue a refresh of every published version of an artifact.
    pub async fn refresh_all_versions(
        &self,
        group_id: &str,
        artifact_id: &str,
        options: RefreshOptions,
    ) -> Result<String> {
        let scope = Gav::all_versions(group_id, artifact_id);
        let parent = ParentEvent::resolve(&scope, options.parent_event_id.as_deref());
        let event =
            Notification::refresh_all_versions(group_id, artifact_id, self.settings.max_attempts);
        let event = self
            .with_project(event, &scope)
            .await?
            .with_parent(parent)
            .with_full_update(options.full_update)
            .with_transitive(options.transitive)
            .with_priority(options.priority);
        self.queue.push(event).await
    }

    /// Queue a refresh of the head snapshot of every known project.
    pub async fn refresh_latest_for_all_projects(
        &self,
        options: RefreshOptions,
    ) -> Result<EnqueueReport> {
        let mut report = EnqueueReport::default();
        for project in self.projects.list().await? {
            let gav = project.version(&self.settings.head_snapshot_version);
            match self.refresh_version(&gav, options.clone()).await {
                Ok(id) => report.event_ids.push(id),
                Err(e) => report.errors.push(format!("{gav}: {e}")),
            }
        }
        Ok(report)
    }

    /// Queue an all-versions refresh for every known project.
    pub async fn refresh_all_versions_for_all_projects(
        &self,
        options: RefreshOptions,
    ) -> Result<EnqueueReport> {
        let mut report = EnqueueReport::default();
        for project in self.projects.list().await? {
            match self
                .refresh_all_versions(&project.group_id, &project.artifact_id, options.clone())
                .await
            {
                Ok(id) => report.event_ids.push(id),
                Err(e) => report
                    .errors
                    .push(format!("{}:{}: {e}", project.group_id, project.artifact_id)),
            }
        }
        Ok(report)
    }

    /// Queue a soft delete of one version.
    pub async fn evict_version(&self, gav: &Gav) -> Result<String> {
        self.push_catalog_action(gav, NotificationAction::Evict).await
    }

    /// Queue a hard delete of one version.
    pub async fn delete_version(&self, gav: &Gav) -> Result<String> {
        self.push_catalog_action(gav, NotificationAction::Delete).await
    }

    /// Queue a deprecation flag for one version.
    pub async fn deprecate_version(&self, gav: &Gav) -> Result<String> {
        self.push_catalog_action(gav, NotificationAction::Deprecate).await
    }

    async fn push_catalog_action(&self, gav: &Gav, action: NotificationAction) -> Result<String> {
        gav.validate()?;
        let event = Notification::new(gav, action, self.settings.max_attempts);
        let event = self.with_project(event, gav).await?;
        self.queue.push(event).await
    }

    async fn with_project(&self, event: Notification, gav: &Gav) -> Result<Notification> {
        Ok(
            match self
                .projects
                .find_by_coordinates(&gav.group_id, &gav.artifact_id)
                .await?
            {
                Some(project) => event.with_project_id(project.project_id),
                None => event,
            },
        )
    }

    // --- Draining ---

    /// Process the first due event, re-verifying it is still queued before
    /// working on it. `None` when the queue had nothing due or another
    /// consumer claimed the event first.
    pub async fn process_next(&self) -> Result<Option<ProcessOutcome>> {
        let Some(head) = self.queue.peek_first().await? else {
            return Ok(None);
        };
        let Some(event) = self.queue.claim(&head.event_id).await? else {
            tracing::debug!(event_id = %head.event_id, "Event claimed by another worker");
            return Ok(None);
        };
        Ok(Some(self.process_notification(event).await))
    }

    /// Pull every due event and process them on a bounded pool.
    pub async fn process_pending(self: &Arc<Self>) -> Result<BatchResponse> {
        let events = self.queue.pull_all().await?;
        let mut batch = BatchResponse::default();
        if events.is_empty() {
            return Ok(batch);
        }

        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for event in events {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| AppError::Internal(format!("worker pool closed: {e}")))?;
            let service = Arc::clone(self);
            tasks.spawn(async move {
                let _permit = permit;
                let id = event.event_id.clone();
                (id, service.process_notification(event).await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            batch.processed += 1;
            match joined {
                Ok((_, ProcessOutcome::Succeeded)) => batch.succeeded += 1,
                Ok((_, ProcessOutcome::Skipped)) => batch.skipped += 1,
                Ok((_, ProcessOutcome::Deferred)) => batch.deferred += 1,
                Ok((_, ProcessOutcome::Retried)) => batch.retried += 1,
                Ok((id, ProcessOutcome::Failed)) => {
                    batch.failed += 1;
                    batch.errors.push(format!("event {id} failed terminally"));
                }
                Err(e) => {
                    batch.failed += 1;
                    batch.errors.push(format!("worker task aborted: {e}"));
                }
            }
        }

        tracing::info!(
            "Processed {} notification(s): {} succeeded, {} skipped, {} deferred, {} retried, {} failed",
            batch.processed,
            batch.succeeded,
            batch.skipped,
            batch.deferred,
            batch.retried,
            batch.failed
        );
        Ok(batch)
    }

    // --- Processing one event ---

    /// Process one event that has already been removed from the queue.
    ///
    /// Never returns an error: every failure is folded into the event's
    /// responses and turned into a retry or a terminal failure.
    pub async fn process_notification(&self, mut event: Notification) -> ProcessOutcome {
        let started = Instant::now();
        let outcome = if let Err(e) = event.validate() {
            self.fail_terminally(event, e).await
        } else if event.action.is_catalog_action() {
            self.process_catalog_action(event).await
        } else {
            let key = event.ledger_key();
            match self.ledger.try_acquire(&key, Some(&event.event_id)).await {
                Ok(LeaseOutcome::Held(_)) => self.defer(event).await,
                Ok(LeaseOutcome::Acquired(_)) => {
                    event.attempt += 1;
                    let run = self.run(&event).await;
                    let response = match &run {
                        Ok(r) => r.response.clone(),
                        Err(e) => RefreshResponse::error(e.to_string()),
                    };
                    if let Err(e) = self.ledger.release(&key, Some(&event.event_id), response).await {
                        tracing::warn!(event_id = %event.event_id, "Failed to release lease on {}: {}", key, e);
                    }
                    self.settle(event, run).await
                }
                Err(e) => {
                    // Could not even read the ledger: count it as a failed attempt.
                    event.attempt += 1;
                    self.settle(event, Err(e)).await
                }
            }
        };
        self.metrics
            .record_refresh(outcome.as_str(), started.elapsed().as_secs_f64());
        outcome
    }

    async fn process_catalog_action(&self, mut event: Notification) -> ProcessOutcome {
        let gav = event.gav();
        let result = match event.action {
            NotificationAction::Evict => self.lifecycle.evict_version(&gav).await,
            NotificationAction::Delete => self.lifecycle.delete_version(&gav).await,
            _ => self.lifecycle.deprecate_version(&gav).await.map(|flagged| {
                if flagged {
                    EvictionOutcome::Evicted
                } else {
                    EvictionOutcome::NotCached
                }
            }),
        };

        match result {
            Ok(EvictionOutcome::Deferred) => self.defer(event).await,
            Ok(outcome) => {
                event.attempt += 1;
                let message = match (event.action, outcome) {
                    (_, EvictionOutcome::NotCached) => format!("{gav}: nothing cached"),
                    (NotificationAction::Deprecate, _) => format!("{gav}: deprecated"),
                    (_, EvictionOutcome::Deleted) => format!("{gav}: deleted"),
                    _ => format!("{gav}: evicted"),
                };
                self.settle(
                    event,
                    Ok(RunResult {
                        response: RefreshResponse::message(message),
                        skipped: false,
                    }),
                )
                .await
            }
            Err(e) => {
                event.attempt += 1;
                self.settle(event, Err(e)).await
            }
        }
    }

    async fn run(&self, event: &Notification) -> Result<RunResult> {
        let work = async {
            match event.action {
                NotificationAction::RefreshAllVersions => self.cascade_versions(event).await,
                _ => self.refresh(event).await,
            }
        };
        tokio::time::timeout(self.settings.run_timeout, work)
            .await
            .map_err(|_| {
                AppError::TransientIo(format!(
                    "refresh of {} exceeded its {}ms lease budget",
                    event.gav(),
                    self.settings.run_timeout.as_millis()
                ))
            })?
    }

    /// Fan an all-versions event out into one child refresh per version.
    async fn cascade_versions(&self, event: &Notification) -> Result<RunResult> {
        let versions = self
            .collaborators
            .repository
            .find_versions(&event.group_id, &event.artifact_id)
            .await?;

        let mut response = RefreshResponse::new();
        for version in versions {
            let gav = Gav::new(&event.group_id, &event.artifact_id, &version);
            let child = event.child(&gav, NotificationAction::Refresh);
            match self.queue.push(child).await {
                Ok(id) => response.add_message(format!("queued {id} for {gav}")),
                Err(e) => response.add_error(format!("{gav}: {e}")),
            }
        }
        tracing::info!(
            event_id = %event.event_id,
            "Cascaded {} child refresh(es) for {}:{}",
            response.messages.len(),
            event.group_id,
            event.artifact_id
        );
        Ok(RunResult {
            response,
            skipped: false,
        })
    }

    /// Refresh one concrete version.
    async fn refresh(&self, event: &Notification) -> Result<RunResult> {
        let gav = event.gav();
        let repository = &self.collaborators.repository;

        let mut files: Vec<ArtifactFile> = Vec::new();
        for artifact_type in &self.settings.artifact_types {
            files.extend(repository.find_files(artifact_type, &gav).await?);
        }

        let cached = self.catalog.get(&gav).await?;
        let cached_live = cached.as_ref().is_some_and(|c| !c.evicted);
        if !event.full_update && cached_live && !self.content_changed(&gav, &files).await? {
            tracing::debug!(event_id = %event.event_id, "{} unchanged, skipping extraction", gav);
            return Ok(RunResult {
                response: RefreshResponse::message(format!("{gav}: unchanged, skipped")),
                skipped: true,
            });
        }

        let response = tokio::time::timeout(
            self.settings.handler_timeout,
            self.collaborators.handler.refresh_version_artifacts(&gav, &files),
        )
        .await
        .map_err(|_| {
            AppError::TransientIo(format!(
                "handler timed out after {}s",
                self.settings.handler_timeout.as_secs()
            ))
        })??;

        if response.has_errors() {
            return Ok(RunResult {
                response,
                skipped: false,
            });
        }

        let mut response = response;
        let now = Utc::now();
        self.record_checksums(&gav, &files, now).await?;

        let mut entry = cached.unwrap_or_else(|| ProjectVersionData::new(gav.clone(), now));
        entry.project_id = event.project_id.clone().or(entry.project_id);
        entry.evicted = false;
        entry.deprecated = false;
        entry.files = files.iter().map(|f| f.path.clone()).collect();
        entry.version_metadata = version_metadata(&files);
        entry.updated = now;

        if event.transitive {
            match self.collaborators.dependencies.resolve(&gav).await {
                Ok(dependencies) => {
                    for dependency in &dependencies {
                        if self.is_cached(dependency).await? {
                            continue;
                        }
                        let mut child = event
                            .child(dependency, NotificationAction::Refresh)
                            .with_transitive(false);
                        child.project_id = None;
                        let child = self.with_project(child, dependency).await?;
                        let id = self.queue.push(child).await?;
                        response.add_message(format!("queued {id} for dependency {dependency}"));
                    }
                    entry.dependencies = dependencies;
                }
                Err(e) => {
                    tracing::warn!(event_id = %event.event_id, "Dependency resolution for {} failed: {}", gav, e);
                    response.add_message(format!("dependency report unavailable: {e}"));
                }
            }
        }

        self.catalog.upsert(entry).await?;
        Ok(RunResult {
            response,
            skipped: false,
        })
    }

    async fn is_cached(&self, gav: &Gav) -> Result<bool> {
        Ok(self.catalog.get(gav).await?.is_some_and(|e| !e.evicted))
    }

    /// Whether the files differ from what the checksum ledger last recorded.
    async fn content_changed(&self, gav: &Gav, files: &[ArtifactFile]) -> Result<bool> {
        let recorded = self.artifact_details.list_for_version(gav).await?;
        if recorded.len() != files.len() {
            return Ok(true);
        }
        for file in files {
            match self.artifact_details.get(&file.path).await? {
                Some(detail) if detail.checksum == file.checksum => {}
                _ => return Ok(true),
            }
        }
        Ok(false)
    }

    async fn record_checksums(
        &self,
        gav: &Gav,
        files: &[ArtifactFile],
        now: chrono::DateTime<Utc>,
    ) -> Result<()> {
        self.artifact_details.remove_for_version(gav).await?;
        for file in files {
            self.artifact_details
                .upsert(ArtifactDetail::from_file(gav, file, now))
                .await?;
        }
        Ok(())
    }

    // --- Outcomes ---

    async fn defer(&self, event: Notification) -> ProcessOutcome {
        tracing::debug!(
            event_id = %event.event_id,
            "{} is busy, deferring {}",
            event.ledger_key(),
            event.action.as_str()
        );
        let id = event.event_id.clone();
        match self.queue.requeue(event, self.settings.defer_delay).await {
            Ok(()) => ProcessOutcome::Deferred,
            Err(e) => {
                tracing::error!(event_id = %id, "Failed to requeue deferred event: {}", e);
                ProcessOutcome::Failed
            }
        }
    }

    async fn settle(&self, mut event: Notification, run: Result<RunResult>) -> ProcessOutcome {
        let now = Utc::now();
        let error = match run {
            Ok(result) if !result.response.has_errors() => {
                event.record_response(NotificationResponse::from_refresh(&result.response, now));
                return self.complete(event, result.skipped).await;
            }
            Ok(result) => {
                event.record_response(NotificationResponse::from_refresh(&result.response, now));
                None
            }
            Err(e) => {
                event.record_response(NotificationResponse::error(
                    format!("{}: {}", e.code(), e),
                    now,
                ));
                Some(e)
            }
        };

        match error.as_ref().map(AppError::kind) {
            Some(ErrorKind::NotFound) => {
                let gav = event.gav();
                if event.action == NotificationAction::Refresh {
                    if let Err(e) = self.lifecycle.deprecate_version(&gav).await {
                        tracing::warn!("Failed to deprecate missing version {}: {}", gav, e);
                    }
                }
                self.archive_failed(event).await
            }
            Some(ErrorKind::Validation) | Some(ErrorKind::Internal) => {
                self.archive_failed(event).await
            }
            // Transient errors and handler-reported errors are retried
            _ if event.attempts_exhausted() => self.archive_failed(event).await,
            _ => {
                let delay = calculate_backoff(self.settings.retry_backoff_base, event.attempt);
                tracing::warn!(
                    event_id = %event.event_id,
                    attempt = event.attempt,
                    max_attempts = event.max_attempts,
                    "Refresh of {} failed, retrying in {}s",
                    event.ledger_key(),
                    delay.as_secs()
                );
                let id = event.event_id.clone();
                match self.queue.requeue(event, delay).await {
                    Ok(()) => ProcessOutcome::Retried,
                    Err(e) => {
                        tracing::error!(event_id = %id, "Failed to requeue event for retry: {}", e);
                        ProcessOutcome::Failed
                    }
                }
            }
        }
    }

    async fn complete(&self, event: Notification, skipped: bool) -> ProcessOutcome {
        tracing::info!(
            event_id = %event.event_id,
            action = event.action.as_str(),
            attempt = event.attempt,
            "Processed {}",
            event.ledger_key()
        );
        let id = event.event_id.clone();
        if let Err(e) = self.queue.complete(event).await {
            tracing::warn!(event_id = %id, "Failed to archive completed event: {}", e);
        }
        if skipped {
            ProcessOutcome::Skipped
        } else {
            ProcessOutcome::Succeeded
        }
    }

    async fn fail_terminally(&self, mut event: Notification, error: AppError) -> ProcessOutcome {
        event.record_response(NotificationResponse::error(error.to_string(), Utc::now()));
        self.archive_failed(event).await
    }

    async fn archive_failed(&self, event: Notification) -> ProcessOutcome {
        tracing::error!(
            event_id = %event.event_id,
            attempt = event.attempt,
            max_attempts = event.max_attempts,
            errors = ?event.accumulated_errors(),
            "Giving up on {} {}",
            event.action.as_str(),
            event.ledger_key()
        );
        let id = event.event_id.clone();
        if let Err(e) = self.queue.fail(event).await {
            tracing::error!(event_id = %id, "Failed to archive failed event: {}", e);
        }
        ProcessOutcome::Failed
    }
}

fn version_metadata(files: &[ArtifactFile]) -> serde_json::Value {
    let mut per_type: BTreeMap<&str, usize> = BTreeMap::new();
    for file in files {
        *per_type.entry(file.artifact_type.as_str()).or_default() += 1;
    }
    serde_json::json!({
        "artifactTypes": per_type,
        "fileCount": files.len(),
    })
}
