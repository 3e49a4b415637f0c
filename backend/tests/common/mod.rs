//! Common test utilities for the engine integration tests
//!
//! This module provides shared infrastructure for testing:
//! - An in-memory artifact repository with failure injection
//! - A handler that counts calls and tracks concurrency
//! - A depot builder over in-memory stores with zero retry delays

#![allow(dead_code)]
#![allow(unused_imports)]

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use metadata_depot_backend::config::Config;
use metadata_depot_backend::depot::Depot;
use metadata_depot_backend::error::{AppError, Result};
use metadata_depot_backend::models::{ArtifactFile, Gav, RefreshResponse};
use metadata_depot_backend::services::artifact_handler::ArtifactHandler;
use metadata_depot_backend::services::dependency_service::RepositoryDependencyResolver;
use metadata_depot_backend::services::metrics_service::NoopMetrics;
use metadata_depot_backend::services::query_metrics::InMemoryQueryMetrics;
use metadata_depot_backend::services::repository_client::ArtifactRepository;
use metadata_depot_backend::services::Collaborators;
use metadata_depot_backend::storage::Stores;

pub const GROUP: &str = "org.example";
pub const ARTIFACT: &str = "model";

pub fn gav(version: &str) -> Gav {
    Gav::new(GROUP, ARTIFACT, version)
}

/// Config with zero retry and defer delays so requeued events are due at once.
pub fn test_config() -> Config {
    Config {
        node_id: "test-node".into(),
        max_attempts: 3,
        retry_backoff_base: Duration::ZERO,
        defer_delay: Duration::ZERO,
        worker_concurrency: 4,
        handler_timeout: Duration::from_secs(5),
        artifact_types: vec!["entities".into(), "file-generation".into()],
        ..Config::default()
    }
}

/// In-memory stand-in for the authoritative repository.
#[derive(Default)]
pub struct FakeRepository {
    versions: Mutex<BTreeMap<(String, String), Vec<String>>>,
    files: Mutex<HashMap<Gav, Vec<ArtifactFile>>>,
    dependencies: Mutex<HashMap<Gav, Vec<Gav>>>,
    failing: Mutex<HashSet<(String, String)>>,
    delay: Mutex<Duration>,
    pub find_files_calls: AtomicUsize,
}

impl FakeRepository {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Publish a version with one `entities` file.
    pub fn publish(&self, gav: &Gav) {
        let file = ArtifactFile {
            artifact_type: "entities".into(),
            path: format!("{}/{}/{}/entities/model.json", gav.group_id, gav.artifact_id, gav.version_id),
            checksum: format!("sha-{}", gav.version_id),
            size_bytes: 128,
        };
        self.publish_with_files(gav, vec![file]);
    }

    pub fn publish_with_files(&self, gav: &Gav, files: Vec<ArtifactFile>) {
        let mut versions = self.versions.lock().unwrap();
        let list = versions.entry(gav.project_key()).or_default();
        if !list.contains(&gav.version_id) {
            list.push(gav.version_id.clone());
        }
        self.files.lock().unwrap().insert(gav.clone(), files);
    }

    /// Change the checksum of every file of a version.
    pub fn republish(&self, gav: &Gav, checksum: &str) {
        if let Some(files) = self.files.lock().unwrap().get_mut(gav) {
            for file in files.iter_mut() {
                file.checksum = checksum.to_string();
            }
        }
    }

    pub fn unpublish(&self, gav: &Gav) {
        if let Some(list) = self.versions.lock().unwrap().get_mut(&gav.project_key()) {
            list.retain(|v| v != &gav.version_id);
        }
        self.files.lock().unwrap().remove(gav);
    }

    pub fn add_dependency(&self, gav: &Gav, dependency: &Gav) {
        self.dependencies
            .lock()
            .unwrap()
            .entry(gav.clone())
            .or_default()
            .push(dependency.clone());
    }

    /// Make every lookup for the artifact fail with a transient error.
    pub fn fail_artifact(&self, group_id: &str, artifact_id: &str) {
        self.failing
            .lock()
            .unwrap()
            .insert((group_id.to_string(), artifact_id.to_string()));
    }

    /// Slow every file listing down by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    fn check_failing(&self, group_id: &str, artifact_id: &str) -> Result<()> {
        let key = (group_id.to_string(), artifact_id.to_string());
        if self.failing.lock().unwrap().contains(&key) {
            return Err(AppError::TransientIo(format!(
                "repository unavailable for {group_id}:{artifact_id}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ArtifactRepository for FakeRepository {
    async fn find_versions(&self, group_id: &str, artifact_id: &str) -> Result<Vec<String>> {
        self.check_failing(group_id, artifact_id)?;
        self.versions
            .lock()
            .unwrap()
            .get(&(group_id.to_string(), artifact_id.to_string()))
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("{group_id}:{artifact_id}")))
    }

    async fn find_files(&self, artifact_type: &str, gav: &Gav) -> Result<Vec<ArtifactFile>> {
        self.find_files_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.check_failing(&gav.group_id, &gav.artifact_id)?;
        let files = self.files.lock().unwrap();
        let Some(files) = files.get(gav) else {
            return Err(AppError::NotFound(gav.to_string()));
        };
        Ok(files
            .iter()
            .filter(|f| f.artifact_type == artifact_type)
            .cloned()
            .collect())
    }

    async fn find_dependencies(&self, gav: &Gav) -> Result<Vec<Gav>> {
        Ok(self
            .dependencies
            .lock()
            .unwrap()
            .get(gav)
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerMode {
    Succeed,
    /// Return a transient error
    FailTransient,
    /// Return a response carrying an error
    ReportError,
}

/// Handler that counts calls and records the peak concurrency per version.
pub struct CountingHandler {
    mode: Mutex<HandlerMode>,
    delay: Mutex<Duration>,
    pub calls: AtomicUsize,
    pub deletes: AtomicUsize,
    in_flight: Mutex<HashMap<Gav, usize>>,
    peak: Mutex<HashMap<Gav, usize>>,
}

impl CountingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            mode: Mutex::new(HandlerMode::Succeed),
            delay: Mutex::new(Duration::ZERO),
            calls: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            in_flight: Mutex::new(HashMap::new()),
            peak: Mutex::new(HashMap::new()),
        })
    }

    pub fn set_mode(&self, mode: HandlerMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak_concurrency(&self, gav: &Gav) -> usize {
        self.peak.lock().unwrap().get(gav).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ArtifactHandler for CountingHandler {
    async fn refresh_version_artifacts(
        &self,
        gav: &Gav,
        files: &[ArtifactFile],
    ) -> Result<RefreshResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            let current = in_flight.entry(gav.clone()).or_default();
            *current += 1;
            let mut peak = self.peak.lock().unwrap();
            let max = peak.entry(gav.clone()).or_default();
            *max = (*max).max(*current);
        }

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(current) = self.in_flight.lock().unwrap().get_mut(gav) {
            *current -= 1;
        }

        let mode = self.mode.lock().unwrap().clone();
        match mode {
            HandlerMode::Succeed => Ok(RefreshResponse::message(format!(
                "{gav}: extracted {} file(s)",
                files.len()
            ))),
            HandlerMode::FailTransient => {
                Err(AppError::TransientIo(format!("{gav}: connection reset")))
            }
            HandlerMode::ReportError => Ok(RefreshResponse::error(format!(
                "{gav}: malformed entity file"
            ))),
        }
    }

    async fn delete(&self, gav: &Gav) -> Result<RefreshResponse> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(RefreshResponse::message(format!("{gav}: removed")))
    }
}

/// A depot over in-memory stores plus handles on its fakes.
pub struct TestDepot {
    pub depot: Depot,
    pub repository: Arc<FakeRepository>,
    pub handler: Arc<CountingHandler>,
    pub query_metrics: Arc<InMemoryQueryMetrics>,
}

impl TestDepot {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: Config) -> Self {
        let repository = FakeRepository::new();
        let handler = CountingHandler::new();
        let query_metrics = Arc::new(InMemoryQueryMetrics::new());
        let shared: Arc<dyn ArtifactRepository> = repository.clone();
        let collaborators = Collaborators {
            repository: shared.clone(),
            handler: handler.clone(),
            dependencies: Arc::new(RepositoryDependencyResolver::new(shared)),
            query_metrics: query_metrics.clone(),
        };
        let depot = Depot::assemble(config, Stores::in_memory(), collaborators, Arc::new(NoopMetrics))
            .expect("test depot should assemble");
        Self {
            depot,
            repository,
            handler,
            query_metrics,
        }
    }

    /// Process due events one at a time until the queue has nothing due.
    pub async fn drain(&self) -> usize {
        let mut processed = 0;
        while self
            .depot
            .refresh()
            .process_next()
            .await
            .expect("process_next failed")
            .is_some()
        {
            processed += 1;
            assert!(processed < 1000, "queue did not drain");
        }
        processed
    }
}
