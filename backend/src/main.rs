//! Metadata Depot - Main Entry Point

use std::sync::Arc;

use metadata_depot_backend::{
    config::Config,
    depot::Depot,
    error::Result,
    services::{
        artifact_handler::CatalogOnlyHandler,
        dependency_service::RepositoryDependencyResolver,
        metrics_service::FacadeMetrics,
        query_metrics::InMemoryQueryMetrics,
        repository_client::{ArtifactRepository, FilesystemRepository},
        Collaborators,
    },
    storage::Stores,
    telemetry,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    telemetry::init_tracing(&config.log_level);
    tracing::info!("Starting Metadata Depot (node {})", config.node_id);

    let repository = Arc::new(FilesystemRepository::new(&config.repository_path));
    let shared_repository: Arc<dyn ArtifactRepository> = repository.clone();
    let collaborators = Collaborators {
        repository: shared_repository.clone(),
        handler: Arc::new(CatalogOnlyHandler),
        dependencies: Arc::new(RepositoryDependencyResolver::new(shared_repository)),
        query_metrics: Arc::new(InMemoryQueryMetrics::new()),
    };
    let depot = Depot::assemble(
        config.clone(),
        Stores::in_memory(),
        collaborators,
        Arc::new(FacadeMetrics),
    )?;

    // Register every project found in the repository
    match repository.discover_projects(&config.artifact_types).await {
        Ok(projects) => {
            tracing::info!(
                "Found {} project(s) under {}",
                projects.len(),
                config.repository_path
            );
            for project in projects {
                if let Err(e) = depot.register_project(project).await {
                    tracing::warn!("Skipping project: {}", e);
                }
            }
        }
        Err(e) => tracing::warn!(
            "Failed to scan repository at {}: {}",
            config.repository_path,
            e
        ),
    }

    // Start schedules; process-notifications drives the refresh worker tick
    let started = depot.scheduler().spawn_all()?;
    tracing::info!("Started {} schedule(s)", started);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    depot.scheduler().shutdown();
    Ok(())
}
