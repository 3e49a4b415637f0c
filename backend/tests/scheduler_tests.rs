//! Integration tests for the scheduler and the standard depot jobs.

mod common;

use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{gav, TestDepot};
use metadata_depot_backend::depot::{PROCESS_NOTIFICATIONS, RECONCILE_VERSIONS, RETENTION_POLICIES};
use metadata_depot_backend::error::{AppError, Result};
use metadata_depot_backend::models::{ProjectCoordinates, ScheduleFrequency};
use metadata_depot_backend::services::metrics_service::NoopMetrics;
use metadata_depot_backend::services::refresh_service::RefreshOptions;
use metadata_depot_backend::services::refresh_worker::spawn_refresh_worker;
use metadata_depot_backend::services::scheduler_service::{JobRun, ScheduledJob, SchedulerService};
use metadata_depot_backend::storage::memory::InMemoryScheduleInstanceStore;
use metadata_depot_backend::storage::ScheduleInstanceStore;

#[derive(Default)]
struct CountingJob {
    runs: AtomicUsize,
    fail: bool,
}

#[async_trait]
impl ScheduledJob for CountingJob {
    async fn run(&self) -> Result<String> {
        let n = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail {
            return Err(AppError::TransientIo("upstream unavailable".into()));
        }
        Ok(format!("run {n}"))
    }
}

fn scheduler(store: Arc<InMemoryScheduleInstanceStore>, node: &str) -> Arc<SchedulerService> {
    Arc::new(SchedulerService::new(
        store,
        node,
        chrono::Duration::minutes(5),
        Arc::new(NoopMetrics),
    ))
}

fn hourly() -> ScheduleFrequency {
    ScheduleFrequency::Cron("0 * * * *".into())
}

#[tokio::test]
async fn test_duplicate_schedule_names_rejected() {
    let s = scheduler(Arc::new(InMemoryScheduleInstanceStore::default()), "node-a");
    let job = Arc::new(CountingJob::default());
    s.register("sweep", hourly(), false, job.clone()).unwrap();
    let err = s.register("sweep", hourly(), true, job).unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
    assert_eq!(s.list().unwrap().len(), 1);
}

#[tokio::test]
async fn test_trigger_records_outcome() {
    let s = scheduler(Arc::new(InMemoryScheduleInstanceStore::default()), "node-a");
    let ok = Arc::new(CountingJob::default());
    let failing = Arc::new(CountingJob {
        fail: true,
        ..Default::default()
    });
    s.register("ok", hourly(), false, ok.clone()).unwrap();
    s.register("failing", hourly(), false, failing).unwrap();

    assert_eq!(s.trigger("ok").await.unwrap(), JobRun::Completed("run 1".into()));
    let info = s.get("ok").unwrap();
    assert_eq!(info.run_count, 1);
    assert_eq!(info.last_message.as_deref(), Some("run 1"));
    assert!(!info.running);
    assert!(info.last_run.is_some());

    assert!(matches!(s.trigger("failing").await.unwrap(), JobRun::Failed(_)));
    let info = s.get("failing").unwrap();
    assert!(info.last_error.unwrap().contains("upstream unavailable"));

    assert!(matches!(
        s.trigger("missing").await.unwrap_err(),
        AppError::NotFound(_)
    ));
}

struct PanickingJob;

#[async_trait]
impl ScheduledJob for PanickingJob {
    async fn run(&self) -> Result<String> {
        panic!("job blew up");
    }
}

#[tokio::test]
async fn test_panicking_job_does_not_wedge_schedule() {
    let store = Arc::new(InMemoryScheduleInstanceStore::default());
    let s = scheduler(store.clone(), "node-a");
    s.register("explode", hourly(), true, Arc::new(PanickingJob)).unwrap();

    for _ in 0..2 {
        let run = s.trigger("explode").await.unwrap();
        assert!(matches!(run, JobRun::Failed(ref e) if e.contains("panicked")));
    }
    let info = s.get("explode").unwrap();
    assert!(!info.running);
    assert_eq!(info.run_count, 2);
    // The singleton lease is handed back too
    assert!(store.get("explode").await.unwrap().is_none());
}

#[tokio::test]
async fn test_singleton_runs_on_one_node_at_a_time() {
    let store = Arc::new(InMemoryScheduleInstanceStore::default());
    let node_a = scheduler(store.clone(), "node-a");
    let node_b = scheduler(store.clone(), "node-b");
    let job = Arc::new(CountingJob::default());
    node_a.register("reconcile", hourly(), true, job.clone()).unwrap();
    node_b.register("reconcile", hourly(), true, job.clone()).unwrap();

    // node-b is mid-run
    store
        .try_acquire("reconcile", "node-b", Utc::now(), chrono::Duration::minutes(5))
        .await
        .unwrap();
    assert_eq!(
        node_a.trigger("reconcile").await.unwrap(),
        JobRun::LeaseHeld {
            owner: "node-b".into()
        }
    );
    assert_eq!(job.runs.load(Ordering::SeqCst), 0);
    assert!(!node_a.get("reconcile").unwrap().running);

    store.release("reconcile", "node-b").await.unwrap();
    assert!(matches!(
        node_a.trigger("reconcile").await.unwrap(),
        JobRun::Completed(_)
    ));
    // The lease is handed back after the run
    assert!(store.get("reconcile").await.unwrap().is_none());
}

#[tokio::test]
async fn test_expired_singleton_lease_is_reclaimed() {
    let store = Arc::new(InMemoryScheduleInstanceStore::default());
    let node_a = scheduler(store.clone(), "node-a");
    let job = Arc::new(CountingJob::default());
    node_a.register("reconcile", hourly(), true, job.clone()).unwrap();

    // node-b died holding a lease that has since lapsed
    store
        .try_acquire(
            "reconcile",
            "node-b",
            Utc::now() - chrono::Duration::hours(1),
            chrono::Duration::minutes(5),
        )
        .await
        .unwrap();
    assert!(matches!(
        node_a.trigger("reconcile").await.unwrap(),
        JobRun::Completed(_)
    ));
    assert_eq!(job.runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_spawned_schedules_fire_and_respect_toggle() {
    let s = scheduler(Arc::new(InMemoryScheduleInstanceStore::default()), "node-a");
    let active = Arc::new(CountingJob::default());
    let paused = Arc::new(CountingJob::default());
    let every = ScheduleFrequency::Every(Duration::from_millis(20));
    s.register("active", every.clone(), false, active.clone()).unwrap();
    s.register("paused", every, false, paused.clone()).unwrap();
    assert!(s.toggle("paused", true).unwrap().disabled);

    assert_eq!(s.spawn_all().unwrap(), 2);
    tokio::time::sleep(Duration::from_millis(300)).await;
    s.shutdown();

    assert!(active.runs.load(Ordering::SeqCst) >= 2);
    assert_eq!(paused.runs.load(Ordering::SeqCst), 0);

    // A manual trigger still runs a disabled job
    assert!(matches!(s.trigger("paused").await.unwrap(), JobRun::Completed(_)));
}

#[tokio::test]
async fn test_zero_interval_rejected() {
    let s = scheduler(Arc::new(InMemoryScheduleInstanceStore::default()), "node-a");
    let err = s
        .register(
            "busy",
            ScheduleFrequency::Every(Duration::ZERO),
            false,
            Arc::new(CountingJob::default()),
        )
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
}

#[tokio::test]
async fn test_process_notifications_job_drains_queue() {
    let t = TestDepot::new();
    t.repository.publish(&gav("1.0.0"));
    t.depot
        .refresh()
        .refresh_version(&gav("1.0.0"), RefreshOptions::default())
        .await
        .unwrap();

    let run = t.depot.scheduler().trigger(PROCESS_NOTIFICATIONS).await.unwrap();
    assert!(matches!(run, JobRun::Completed(ref m) if m.contains("processed 1")));
    assert_eq!(t.depot.queue().size().await.unwrap(), 0);
    assert!(t.depot.stores().catalog.get(&gav("1.0.0")).await.unwrap().is_some());
}

#[tokio::test]
async fn test_reconcile_and_retention_jobs_run() {
    let t = TestDepot::new();
    t.depot
        .register_project(ProjectCoordinates::new("example.model", common::GROUP, common::ARTIFACT))
        .await
        .unwrap();
    t.repository.publish(&gav("1.0.0"));

    let run = t.depot.scheduler().trigger(RECONCILE_VERSIONS).await.unwrap();
    assert!(matches!(run, JobRun::Completed(ref m) if m.contains("1 refresh(es)")));
    assert_eq!(t.depot.queue().size().await.unwrap(), 1);

    let run = t.depot.scheduler().trigger(RETENTION_POLICIES).await.unwrap();
    assert!(matches!(run, JobRun::Completed(_)));
}

#[tokio::test]
async fn test_background_worker_processes_queue() {
    let t = TestDepot::new();
    t.repository.publish(&gav("1.0.0"));
    t.depot
        .refresh()
        .refresh_version(&gav("1.0.0"), RefreshOptions::default())
        .await
        .unwrap();

    let handle = spawn_refresh_worker(
        t.depot.refresh().clone(),
        t.depot.ledger().clone(),
        Duration::from_millis(20),
        Duration::ZERO,
    );
    let mut cached = false;
    for _ in 0..100 {
        if t.depot.stores().catalog.get(&gav("1.0.0")).await.unwrap().is_some() {
            cached = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    handle.abort();
    assert!(cached);
}
