//! Transitive dependency lookup.
//!
//! Only the contract the refresh orchestrator calls is defined here, plus a
//! thin adapter that walks the repository's declared dependencies. Version
//! conflict resolution is out of scope.

use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use crate::error::{AppError, Result};
use crate::models::Gav;
use crate::services::repository_client::ArtifactRepository;

/// Default bound on how many dependency levels are followed.
pub const DEFAULT_MAX_DEPTH: usize = 16;

#[async_trait]
pub trait DependencyResolver: Send + Sync {
    /// All transitive dependencies of `gav`, without `gav` itself.
    async fn resolve(&self, gav: &Gav) -> Result<Vec<Gav>>;
}

/// Breadth-first walk over `ArtifactRepository::find_dependencies`.
pub struct RepositoryDependencyResolver {
    repository: Arc<dyn ArtifactRepository>,
    max_depth: usize,
}

impl RepositoryDependencyResolver {
    pub fn new(repository: Arc<dyn ArtifactRepository>) -> Self {
        Self {
            repository,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }
}

#[async_trait]
impl DependencyResolver for RepositoryDependencyResolver {
    async fn resolve(&self, gav: &Gav) -> Result<Vec<Gav>> {
        let mut seen: HashSet<Gav> = HashSet::from([gav.clone()]);
        let mut resolved = Vec::new();
        let mut frontier = VecDeque::from([(gav.clone(), 0usize)]);

        while let Some((current, depth)) = frontier.pop_front() {
            if depth >= self.max_depth {
                tracing::debug!("Dependency walk for {} stopped at depth {}", gav, depth);
                continue;
            }
            let direct = match self.repository.find_dependencies(&current).await {
                Ok(direct) => direct,
                // A declared dependency the repository does not have is still
                // reported; there is just nothing below it to walk.
                Err(AppError::NotFound(_)) if &current != gav => continue,
                Err(e) => return Err(e),
            };
            for dependency in direct {
                if seen.insert(dependency.clone()) {
                    resolved.push(dependency.clone());
                    frontier.push_back((dependency, depth + 1));
                }
            }
        }

        Ok(resolved)
    }
}
