//! Business logic services.

pub mod artifact_handler;
pub mod dependency_service;
pub mod lifecycle_service;
pub mod metrics_service;
pub mod notification_queue;
pub mod query_metrics;
pub mod reconciliation_service;
pub mod refresh_ledger;
pub mod refresh_service;
pub mod refresh_worker;
pub mod repository_client;
pub mod scheduler_service;

use std::sync::Arc;

use artifact_handler::ArtifactHandler;
use dependency_service::DependencyResolver;
use query_metrics::QueryMetricsSource;
use repository_client::ArtifactRepository;

/// External systems the engine talks to, injected at assembly time.
#[derive(Clone)]
pub struct Collaborators {
    pub repository: Arc<dyn ArtifactRepository>,
    pub handler: Arc<dyn ArtifactHandler>,
    pub dependencies: Arc<dyn DependencyResolver>,
    pub query_metrics: Arc<dyn QueryMetricsSource>,
}
