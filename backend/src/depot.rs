//! Engine assembly.
//!
//! `Depot::assemble` is the single place where stores, collaborators and
//! services are wired together. Everything below it takes its dependencies
//! as constructor parameters.

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::models::{Gav, ProjectCoordinates, RefreshStatus, ScheduleFrequency};
use crate::services::artifact_handler::ArtifactHandler;
use crate::services::dependency_service::RepositoryDependencyResolver;
use crate::services::lifecycle_service::{LifecycleService, LifecycleSettings};
use crate::services::metrics_service::{MetricsSink, NoopMetrics};
use crate::services::notification_queue::NotificationQueue;
use crate::services::query_metrics::InMemoryQueryMetrics;
use crate::services::reconciliation_service::ReconciliationService;
use crate::services::refresh_ledger::RefreshLedger;
use crate::services::refresh_service::{RefreshService, RefreshSettings};
use crate::services::refresh_worker;
use crate::services::repository_client::ArtifactRepository;
use crate::services::scheduler_service::{ScheduledJob, SchedulerService};
use crate::services::Collaborators;
use crate::storage::Stores;

pub const PROCESS_NOTIFICATIONS: &str = "process-notifications";
pub const RECONCILE_VERSIONS: &str = "reconcile-versions";
pub const RETENTION_POLICIES: &str = "retention-policies";
pub const PURGE_NOTIFICATIONS: &str = "purge-notifications";

/// Archived notifications are purged once a day.
const PURGE_SCHEDULE: &str = "0 15 3 * * *";

/// A fully wired engine.
pub struct Depot {
    config: Config,
    stores: Stores,
    collaborators: Collaborators,
    queue: Arc<NotificationQueue>,
    ledger: Arc<RefreshLedger>,
    lifecycle: Arc<LifecycleService>,
    refresh: Arc<RefreshService>,
    reconciliation: Arc<ReconciliationService>,
    scheduler: Arc<SchedulerService>,
}

impl Depot {
    /// Build every service over the given stores and register the standard
    /// schedules.
    pub fn assemble(
        config: Config,
        stores: Stores,
        collaborators: Collaborators,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        config.validate()?;

        let queue = Arc::new(NotificationQueue::new(
            stores.notifications.clone(),
            metrics.clone(),
        ));
        let ledger = Arc::new(RefreshLedger::new(
            stores.refresh_status.clone(),
            config.lease_duration(),
        ));
        let lifecycle = Arc::new(LifecycleService::new(
            stores.catalog.clone(),
            stores.artifact_details.clone(),
            ledger.clone(),
            collaborators.repository.clone(),
            collaborators.handler.clone(),
            collaborators.query_metrics.clone(),
            metrics.clone(),
            LifecycleSettings::from(&config),
        ));
        let refresh = Arc::new(RefreshService::new(
            queue.clone(),
            ledger.clone(),
            lifecycle.clone(),
            &stores,
            collaborators.clone(),
            metrics.clone(),
            RefreshSettings::from(&config),
        ));
        let reconciliation = Arc::new(ReconciliationService::new(
            stores.projects.clone(),
            stores.catalog.clone(),
            collaborators.repository.clone(),
            refresh.clone(),
            metrics.clone(),
            config.worker_concurrency,
        ));
        let scheduler = Arc::new(SchedulerService::new(
            stores.schedules.clone(),
            config.node_id.clone(),
            config.lease_duration(),
            metrics,
        ));

        let depot = Self {
            config,
            stores,
            collaborators,
            queue,
            ledger,
            lifecycle,
            refresh,
            reconciliation,
            scheduler,
        };
        depot.register_standard_jobs()?;
        Ok(depot)
    }

    /// In-memory stores, a repository-backed dependency resolver and no
    /// metrics recorder.
    pub fn in_memory(
        config: Config,
        repository: Arc<dyn ArtifactRepository>,
        handler: Arc<dyn ArtifactHandler>,
    ) -> Result<Self> {
        let collaborators = Collaborators {
            dependencies: Arc::new(RepositoryDependencyResolver::new(repository.clone())),
            repository,
            handler,
            query_metrics: Arc::new(InMemoryQueryMetrics::new()),
        };
        Self::assemble(config, Stores::in_memory(), collaborators, Arc::new(NoopMetrics))
    }

    fn register_standard_jobs(&self) -> Result<()> {
        self.scheduler.register(
            PROCESS_NOTIFICATIONS,
            ScheduleFrequency::Every(self.config.worker_interval),
            false,
            Arc::new(ProcessNotificationsJob {
                refresh: self.refresh.clone(),
                ledger: self.ledger.clone(),
            }),
        )?;
        self.scheduler.register(
            RECONCILE_VERSIONS,
            ScheduleFrequency::Cron(self.config.reconcile_schedule.clone()),
            true,
            Arc::new(ReconcileJob {
                reconciliation: self.reconciliation.clone(),
            }),
        )?;
        self.scheduler.register(
            RETENTION_POLICIES,
            ScheduleFrequency::Cron(self.config.retention_schedule.clone()),
            true,
            Arc::new(RetentionJob {
                lifecycle: self.lifecycle.clone(),
            }),
        )?;
        self.scheduler.register(
            PURGE_NOTIFICATIONS,
            ScheduleFrequency::Cron(PURGE_SCHEDULE.into()),
            true,
            Arc::new(PurgeNotificationsJob {
                queue: self.queue.clone(),
                ttl: chrono::Duration::days(self.config.notification_ttl_days),
            }),
        )?;
        Ok(())
    }

    /// Register (or re-register) a project for reconciliation and bulk refresh.
    pub async fn register_project(&self, project: ProjectCoordinates) -> Result<()> {
        project.validate()?;
        tracing::info!(
            "Registering project {} ({}:{})",
            project.project_id,
            project.group_id,
            project.artifact_id
        );
        self.stores.projects.upsert(project).await
    }

    pub async fn list_projects(&self) -> Result<Vec<ProjectCoordinates>> {
        self.stores.projects.list().await
    }

    pub async fn refresh_status(&self, gav: &Gav) -> Result<RefreshStatus> {
        self.ledger
            .get(gav)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("refresh status for {gav}")))
    }

    pub async fn list_refresh_status(&self) -> Result<Vec<RefreshStatus>> {
        self.ledger.list().await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    pub fn queue(&self) -> &Arc<NotificationQueue> {
        &self.queue
    }

    pub fn ledger(&self) -> &Arc<RefreshLedger> {
        &self.ledger
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleService> {
        &self.lifecycle
    }

    pub fn refresh(&self) -> &Arc<RefreshService> {
        &self.refresh
    }

    pub fn reconciliation(&self) -> &Arc<ReconciliationService> {
        &self.reconciliation
    }

    pub fn scheduler(&self) -> &Arc<SchedulerService> {
        &self.scheduler
    }
}

struct ProcessNotificationsJob {
    refresh: Arc<RefreshService>,
    ledger: Arc<RefreshLedger>,
}

#[async_trait]
impl ScheduledJob for ProcessNotificationsJob {
    async fn run(&self) -> Result<String> {
        let batch = refresh_worker::run_once(&self.refresh, &self.ledger).await;
        Ok(format!(
            "processed {} notification(s): {} succeeded, {} failed",
            batch.processed, batch.succeeded, batch.failed
        ))
    }
}

struct ReconcileJob {
    reconciliation: Arc<ReconciliationService>,
}

#[async_trait]
impl ScheduledJob for ReconcileJob {
    async fn run(&self) -> Result<String> {
        let report = self.reconciliation.reconcile().await?;
        let mut message = format!(
            "{} mismatch(es), {} refresh(es) and {} deprecation(s) queued",
            report.mismatches.len(),
            report.refresh_event_ids.len(),
            report.deprecate_event_ids.len()
        );
        if !report.errors.is_empty() {
            message.push_str(&format!(", {} error(s)", report.errors.len()));
        }
        Ok(message)
    }
}

struct RetentionJob {
    lifecycle: Arc<LifecycleService>,
}

#[async_trait]
impl ScheduledJob for RetentionJob {
    async fn run(&self) -> Result<String> {
        let reports = self.lifecycle.execute_all_configured().await;
        let evicted: usize = reports.iter().map(|r| r.evicted.len()).sum();
        let deferred: usize = reports.iter().map(|r| r.deferred.len()).sum();
        let errors: Vec<String> = reports
            .iter()
            .flat_map(|r| r.errors.iter().map(move |e| format!("{}: {}", r.policy, e)))
            .collect();
        if !errors.is_empty() && evicted == 0 {
            return Err(AppError::Internal(errors.join("; ")));
        }
        Ok(format!(
            "{} polic(ies) run, {} version(s) evicted, {} deferred, {} error(s)",
            reports.len(),
            evicted,
            deferred,
            errors.len()
        ))
    }
}

struct PurgeNotificationsJob {
    queue: Arc<NotificationQueue>,
    ttl: chrono::Duration,
}

#[async_trait]
impl ScheduledJob for PurgeNotificationsJob {
    async fn run(&self) -> Result<String> {
        let purged = self.queue.purge_archived_older_than(self.ttl).await?;
        Ok(format!("purged {purged} archived notification(s)"))
    }
}
