//! Integration tests for the refresh orchestrator.
//!
//! Everything runs over in-memory stores with a fake repository and a
//! counting handler, so no external services are needed:
//!
//! ```sh
//! cargo test --test refresh_engine_tests
//! ```

mod common;

use chrono::Utc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{gav, HandlerMode, TestDepot, ARTIFACT, GROUP};
use metadata_depot_backend::error::AppError;
use metadata_depot_backend::models::{
    Gav, NotificationAction, NotificationStatus, ProjectCoordinates, RefreshStatus,
};
use metadata_depot_backend::services::notification_queue::HistoryFilter;
use metadata_depot_backend::services::refresh_service::{ProcessOutcome, RefreshOptions};
use metadata_depot_backend::services::refresh_worker;

fn full_update() -> RefreshOptions {
    RefreshOptions {
        full_update: true,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_refresh_populates_catalog_and_ledger() {
    let t = TestDepot::new();
    let v1 = gav("1.0.0");
    t.repository.publish(&v1);
    t.depot
        .register_project(ProjectCoordinates::new("example.model", GROUP, ARTIFACT))
        .await
        .unwrap();

    let id = t
        .depot
        .refresh()
        .refresh_version(&v1, RefreshOptions::default())
        .await
        .unwrap();
    assert_eq!(t.drain().await, 1);

    let entry = t.depot.stores().catalog.get(&v1).await.unwrap().unwrap();
    assert!(entry.is_available());
    assert_eq!(entry.project_id.as_deref(), Some("example.model"));
    assert_eq!(entry.files.len(), 1);
    assert_eq!(entry.version_metadata["fileCount"], 1);

    let status = t.depot.refresh_status(&v1).await.unwrap();
    assert!(!status.running);
    assert!(status.last_run.is_some());
    assert!(status.expires.is_none());

    let event = t.depot.queue().get(&id).await.unwrap().unwrap();
    assert_eq!(event.status, NotificationStatus::Completed);
    assert_eq!(event.attempt, 1);
    assert_eq!(event.parent_event_id.as_deref(), Some("org.example_model_1.0.0"));
    assert!(event.completed.is_some());
    assert_eq!(t.depot.queue().size().await.unwrap(), 0);
}

#[tokio::test]
async fn test_concurrent_refreshes_of_one_version_never_overlap() {
    let t = TestDepot::new();
    let v1 = gav("1.0.0");
    t.repository.publish(&v1);
    t.handler.set_delay(Duration::from_millis(200));

    let refresh = t.depot.refresh().clone();
    refresh.refresh_version(&v1, full_update()).await.unwrap();
    refresh.refresh_version(&v1, full_update()).await.unwrap();

    let batch = refresh.process_pending().await.unwrap();
    assert_eq!(batch.processed, 2);
    assert_eq!(batch.succeeded, 1);
    assert_eq!(batch.deferred, 1);
    assert_eq!(t.handler.calls(), 1);

    // The deferred event is still queued and runs once the lease is free
    assert_eq!(t.depot.queue().size().await.unwrap(), 1);
    let batch = refresh.process_pending().await.unwrap();
    assert_eq!(batch.succeeded, 1);
    assert_eq!(t.handler.calls(), 2);
    assert_eq!(t.handler.peak_concurrency(&v1), 1);
}

#[tokio::test]
async fn test_deferral_does_not_consume_an_attempt() {
    let t = TestDepot::new();
    let v1 = gav("1.0.0");
    t.repository.publish(&v1);

    // Another worker holds the lease
    t.depot.ledger().try_acquire(&v1, Some("elsewhere")).await.unwrap();
    let id = t
        .depot
        .refresh()
        .refresh_version(&v1, RefreshOptions::default())
        .await
        .unwrap();

    let outcome = t.depot.refresh().process_next().await.unwrap();
    assert_eq!(outcome, Some(ProcessOutcome::Deferred));
    let queued = t.depot.queue().get(&id).await.unwrap().unwrap();
    assert_eq!(queued.status, NotificationStatus::Pending);
    assert_eq!(queued.attempt, 0);
    assert_eq!(t.handler.calls(), 0);

    t.depot
        .ledger()
        .release(&v1, Some("elsewhere"), Default::default())
        .await
        .unwrap();
    assert_eq!(
        t.depot.refresh().process_next().await.unwrap(),
        Some(ProcessOutcome::Succeeded)
    );
    assert_eq!(t.handler.calls(), 1);
}

#[tokio::test]
async fn test_transient_failures_stop_at_max_attempts() {
    let t = TestDepot::new();
    let v1 = gav("1.0.0");
    t.repository.publish(&v1);
    t.handler.set_mode(HandlerMode::FailTransient);

    let id = t
        .depot
        .refresh()
        .refresh_version(&v1, RefreshOptions::default())
        .await
        .unwrap();
    t.drain().await;

    assert_eq!(t.handler.calls(), 3);
    let event = t.depot.queue().get(&id).await.unwrap().unwrap();
    assert_eq!(event.status, NotificationStatus::Failed);
    assert_eq!(event.attempt, 3);
    assert_eq!(event.responses.len(), 3);
    let errors = event.accumulated_errors();
    assert_eq!(errors.len(), 3);
    assert!(errors[0].starts_with("[attempt 1]"));
    assert!(errors[2].contains("connection reset"));
    assert_eq!(t.depot.queue().size().await.unwrap(), 0);

    // Nothing was cached
    assert!(t.depot.stores().catalog.get(&v1).await.unwrap().is_none());
}

#[tokio::test]
async fn test_handler_reported_errors_are_retried() {
    let t = TestDepot::new();
    let v1 = gav("1.0.0");
    t.repository.publish(&v1);
    t.handler.set_mode(HandlerMode::ReportError);

    let id = t
        .depot
        .refresh()
        .refresh_version(&v1, RefreshOptions::default())
        .await
        .unwrap();
    assert_eq!(
        t.depot.refresh().process_next().await.unwrap(),
        Some(ProcessOutcome::Retried)
    );

    t.handler.set_mode(HandlerMode::Succeed);
    assert_eq!(
        t.depot.refresh().process_next().await.unwrap(),
        Some(ProcessOutcome::Succeeded)
    );
    let event = t.depot.queue().get(&id).await.unwrap().unwrap();
    assert_eq!(event.attempt, 2);
    assert!(event.responses[&1].has_errors());
    assert!(!event.responses[&2].has_errors());
}

#[tokio::test]
async fn test_handler_timeout_is_a_transient_failure() {
    let mut config = common::test_config();
    config.handler_timeout = Duration::from_millis(50);
    config.max_attempts = 1;
    let t = TestDepot::with_config(config);
    let v1 = gav("1.0.0");
    t.repository.publish(&v1);
    t.handler.set_delay(Duration::from_millis(500));

    let id = t
        .depot
        .refresh()
        .refresh_version(&v1, RefreshOptions::default())
        .await
        .unwrap();
    assert_eq!(
        t.depot.refresh().process_next().await.unwrap(),
        Some(ProcessOutcome::Failed)
    );
    let event = t.depot.queue().get(&id).await.unwrap().unwrap();
    assert!(event.accumulated_errors()[0].contains("timed out"));

    // The lease is released even though the handler never returned
    assert!(!t.depot.ledger().is_running(&v1).await.unwrap());
}

#[tokio::test]
async fn test_slow_repository_cannot_outlast_the_lease() {
    let mut config = common::test_config();
    config.lease_window = Duration::from_millis(500);
    config.handler_timeout = Duration::from_millis(100);
    config.max_attempts = 1;
    let t = TestDepot::with_config(config);
    let v1 = gav("1.0.0");
    t.repository.publish(&v1);
    t.repository.set_delay(Duration::from_secs(2));

    let id = t
        .depot
        .refresh()
        .refresh_version(&v1, RefreshOptions::default())
        .await
        .unwrap();
    assert_eq!(
        t.depot.refresh().process_next().await.unwrap(),
        Some(ProcessOutcome::Failed)
    );
    let event = t.depot.queue().get(&id).await.unwrap().unwrap();
    assert!(event.accumulated_errors()[0].contains("lease budget"));
    assert_eq!(t.handler.calls(), 0);

    // The run gave up before the lease lapsed and handed it back
    assert!(!t.depot.ledger().is_running(&v1).await.unwrap());
    assert!(t.depot.stores().catalog.get(&v1).await.unwrap().is_none());
}

#[tokio::test]
async fn test_depot_rejects_a_disabled_lease() {
    let mut config = common::test_config();
    config.lease_window = Duration::ZERO;
    let err = metadata_depot_backend::Depot::in_memory(
        config,
        common::FakeRepository::new(),
        common::CountingHandler::new(),
    )
    .err()
    .expect("zero lease must be rejected");
    assert!(matches!(err, AppError::Config(_)));
}

#[tokio::test]
async fn test_abandoned_lease_is_taken_over() {
    let t = TestDepot::new();
    let v1 = gav("1.0.0");
    t.repository.publish(&v1);

    // A worker crashed an hour ago while holding the lease
    let mut stale = RefreshStatus::new(v1.clone());
    stale.start(
        Utc::now() - chrono::Duration::hours(1),
        chrono::Duration::minutes(10),
        Some("crashed".into()),
    );
    t.depot.stores().refresh_status.upsert(stale).await.unwrap();
    assert!(!t.depot.ledger().is_running(&v1).await.unwrap());

    t.depot
        .refresh()
        .refresh_version(&v1, RefreshOptions::default())
        .await
        .unwrap();
    assert_eq!(
        t.depot.refresh().process_next().await.unwrap(),
        Some(ProcessOutcome::Succeeded)
    );
    let status = t.depot.refresh_status(&v1).await.unwrap();
    assert!(!status.running);
    assert!(status.event_id.is_none());
}

#[tokio::test]
async fn test_worker_tick_clears_abandoned_leases() {
    let t = TestDepot::new();
    let v1 = gav("1.0.0");
    let mut stale = RefreshStatus::new(v1.clone());
    stale.start(
        Utc::now() - chrono::Duration::hours(1),
        chrono::Duration::minutes(10),
        Some("crashed".into()),
    );
    t.depot.stores().refresh_status.upsert(stale).await.unwrap();

    let batch = refresh_worker::run_once(t.depot.refresh(), t.depot.ledger()).await;
    assert_eq!(batch.processed, 0);
    let status = t.depot.refresh_status(&v1).await.unwrap();
    assert!(!status.running);
}

#[tokio::test]
async fn test_all_versions_cascade_links_children() {
    let t = TestDepot::new();
    t.repository.publish(&gav("1.0.0"));
    t.repository.publish(&gav("2.0.0"));

    let parent_id = t
        .depot
        .refresh()
        .refresh_all_versions(GROUP, ARTIFACT, RefreshOptions::default())
        .await
        .unwrap();
    let parent = t.depot.queue().get(&parent_id).await.unwrap().unwrap();
    assert_eq!(parent.action, NotificationAction::RefreshAllVersions);
    assert_eq!(parent.parent_event_id.as_deref(), Some("org.example_model_all"));

    assert_eq!(t.drain().await, 3);

    let children = t.depot.queue().children_of(&parent_id).await.unwrap();
    assert_eq!(children.len(), 2);
    assert!(children
        .iter()
        .all(|c| c.status == NotificationStatus::Completed && c.action == NotificationAction::Refresh));
    for version in ["1.0.0", "2.0.0"] {
        assert!(t.depot.stores().catalog.get(&gav(version)).await.unwrap().is_some());
    }

    let history = t
        .depot
        .queue()
        .history(&HistoryFilter {
            parent_event_id: Some(parent_id.clone()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
}

#[tokio::test]
async fn test_unchanged_content_is_skipped() {
    let t = TestDepot::new();
    let v1 = gav("1.0.0");
    t.repository.publish(&v1);
    let refresh = t.depot.refresh();

    refresh.refresh_version(&v1, RefreshOptions::default()).await.unwrap();
    refresh.refresh_version(&v1, RefreshOptions::default()).await.unwrap();
    assert_eq!(refresh.process_next().await.unwrap(), Some(ProcessOutcome::Succeeded));
    assert_eq!(refresh.process_next().await.unwrap(), Some(ProcessOutcome::Skipped));
    assert_eq!(t.handler.calls(), 1);

    // New content is extracted again
    t.repository.republish(&v1, "sha-changed");
    refresh.refresh_version(&v1, RefreshOptions::default()).await.unwrap();
    assert_eq!(refresh.process_next().await.unwrap(), Some(ProcessOutcome::Succeeded));
    assert_eq!(t.handler.calls(), 2);
}

#[tokio::test]
async fn test_full_update_reprocesses_identical_content() {
    let t = TestDepot::new();
    let v1 = gav("1.0.0");
    t.repository.publish(&v1);
    let refresh = t.depot.refresh();

    refresh.refresh_version(&v1, full_update()).await.unwrap();
    t.drain().await;
    let first = t.depot.stores().catalog.get(&v1).await.unwrap().unwrap();

    refresh.refresh_version(&v1, full_update()).await.unwrap();
    t.drain().await;
    let second = t.depot.stores().catalog.get(&v1).await.unwrap().unwrap();

    assert_eq!(t.handler.calls(), 2);
    assert_eq!(first.created, second.created);
    assert_eq!(first.files, second.files);
    assert!(second.updated >= first.updated);
}

#[tokio::test]
async fn test_missing_version_fails_terminally_and_deprecates() {
    let t = TestDepot::new();
    let v1 = gav("1.0.0");
    t.repository.publish(&v1);
    t.depot
        .refresh()
        .refresh_version(&v1, RefreshOptions::default())
        .await
        .unwrap();
    t.drain().await;

    t.repository.unpublish(&v1);
    let id = t
        .depot
        .refresh()
        .refresh_version(&v1, full_update())
        .await
        .unwrap();
    assert_eq!(
        t.depot.refresh().process_next().await.unwrap(),
        Some(ProcessOutcome::Failed)
    );

    let event = t.depot.queue().get(&id).await.unwrap().unwrap();
    assert_eq!(event.status, NotificationStatus::Failed);
    assert_eq!(event.attempt, 1);
    let entry = t.depot.stores().catalog.get(&v1).await.unwrap().unwrap();
    assert!(entry.deprecated);
    assert!(!entry.evicted);
}

#[tokio::test]
async fn test_transitive_refresh_queues_uncached_dependencies() {
    let t = TestDepot::new();
    let app = Gav::new("org.example", "app", "1.0.0");
    let lib = Gav::new("org.example", "lib", "2.1.0");
    let base = Gav::new("org.example", "base", "0.9.0");
    for g in [&app, &lib, &base] {
        t.repository.publish(g);
    }
    t.repository.add_dependency(&app, &lib);
    t.repository.add_dependency(&lib, &base);
    t.depot
        .register_project(ProjectCoordinates::new("example.lib", "org.example", "lib"))
        .await
        .unwrap();

    // base is already cached
    t.depot
        .refresh()
        .refresh_version(&base, RefreshOptions::default())
        .await
        .unwrap();
    t.drain().await;

    let id = t
        .depot
        .refresh()
        .refresh_version(
            &app,
            RefreshOptions {
                transitive: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    t.drain().await;

    let entry = t.depot.stores().catalog.get(&app).await.unwrap().unwrap();
    assert_eq!(entry.dependencies, vec![lib.clone(), base.clone()]);

    let children = t.depot.queue().children_of(&id).await.unwrap();
    assert_eq!(children.len(), 1);
    let child = &children[0];
    assert_eq!(child.gav(), lib);
    assert!(!child.transitive);
    assert_eq!(child.project_id.as_deref(), Some("example.lib"));
    assert_eq!(child.status, NotificationStatus::Completed);
    assert!(t.depot.stores().catalog.get(&lib).await.unwrap().is_some());
}

#[tokio::test]
async fn test_catalog_actions_run_through_the_queue() {
    let t = TestDepot::new();
    let v1 = gav("1.0.0");
    let v2 = gav("2.0.0");
    t.repository.publish(&v1);
    t.repository.publish(&v2);
    let refresh = t.depot.refresh();
    refresh.refresh_version(&v1, RefreshOptions::default()).await.unwrap();
    refresh.refresh_version(&v2, RefreshOptions::default()).await.unwrap();
    t.drain().await;

    refresh.evict_version(&v1).await.unwrap();
    refresh.delete_version(&v2).await.unwrap();
    t.drain().await;

    let evicted = t.depot.stores().catalog.get(&v1).await.unwrap().unwrap();
    assert!(evicted.evicted);
    assert!(t.depot.stores().catalog.get(&v2).await.unwrap().is_none());
    assert!(t
        .depot
        .stores()
        .artifact_details
        .list_for_version(&v1)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(t.handler.deletes.load(Ordering::SeqCst), 2);

    // Refreshing an evicted version brings it back
    refresh.refresh_version(&v1, RefreshOptions::default()).await.unwrap();
    t.drain().await;
    let restored = t.depot.stores().catalog.get(&v1).await.unwrap().unwrap();
    assert!(restored.is_available());
}

#[tokio::test]
async fn test_invalid_coordinates_are_rejected_on_enqueue() {
    let t = TestDepot::new();
    let refresh = t.depot.refresh();

    let bad = Gav::new("org.example", "", "1.0.0");
    let err = refresh
        .refresh_version(&bad, RefreshOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    let reserved = gav("all");
    assert!(refresh.evict_version(&reserved).await.is_err());
    assert_eq!(t.depot.queue().size().await.unwrap(), 0);
}

#[tokio::test]
async fn test_bulk_entry_points_cover_every_project() {
    let t = TestDepot::new();
    t.depot
        .register_project(ProjectCoordinates::new("example.model", GROUP, ARTIFACT))
        .await
        .unwrap();
    t.depot
        .register_project(ProjectCoordinates::new("example.other", GROUP, "other"))
        .await
        .unwrap();

    let refresh = t.depot.refresh();
    let latest = refresh
        .refresh_latest_for_all_projects(RefreshOptions::default())
        .await
        .unwrap();
    assert_eq!(latest.event_ids.len(), 2);
    assert!(latest.errors.is_empty());

    let all = refresh
        .refresh_all_versions_for_all_projects(RefreshOptions::default())
        .await
        .unwrap();
    assert_eq!(all.event_ids.len(), 2);

    let queued = t.depot.queue().get_all().await.unwrap();
    assert_eq!(queued.len(), 4);
    assert!(queued
        .iter()
        .filter(|e| e.action == NotificationAction::Refresh)
        .all(|e| e.version_id == "master-SNAPSHOT"));
}

#[tokio::test]
async fn test_higher_priority_events_are_processed_first() {
    let t = TestDepot::new();
    let v1 = gav("1.0.0");
    let v2 = gav("2.0.0");
    let refresh = t.depot.refresh();
    refresh.refresh_version(&v1, RefreshOptions::default()).await.unwrap();
    refresh
        .refresh_version(
            &v2,
            RefreshOptions {
                priority: 10,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let head = t.depot.queue().peek_first().await.unwrap().unwrap();
    assert_eq!(head.version_id, "2.0.0");
}
