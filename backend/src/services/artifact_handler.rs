//! Artifact handler: turns repository files into cached content.

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::error::Result;
use crate::models::{ArtifactFile, Gav, RefreshResponse};

/// Extracts (and removes) the cached content of one version.
///
/// Expected domain failures are reported in the response's `errors`; an `Err`
/// is reserved for failures the orchestrator should classify (not found,
/// transient I/O).
#[async_trait]
pub trait ArtifactHandler: Send + Sync {
    async fn refresh_version_artifacts(
        &self,
        gav: &Gav,
        files: &[ArtifactFile],
    ) -> Result<RefreshResponse>;

    async fn delete(&self, gav: &Gav) -> Result<RefreshResponse>;
}

/// Handler that extracts nothing: the orchestrator's catalog entry (file
/// list and checksums) is the only record kept.
#[derive(Debug, Default, Clone, Copy)]
pub struct CatalogOnlyHandler;

#[async_trait]
impl ArtifactHandler for CatalogOnlyHandler {
    async fn refresh_version_artifacts(
        &self,
        gav: &Gav,
        files: &[ArtifactFile],
    ) -> Result<RefreshResponse> {
        let mut per_type: BTreeMap<&str, usize> = BTreeMap::new();
        for file in files {
            *per_type.entry(file.artifact_type.as_str()).or_default() += 1;
        }

        let mut response = RefreshResponse::new();
        if per_type.is_empty() {
            response.add_message(format!("{gav}: no artifacts found"));
        }
        for (artifact_type, count) in per_type {
            response.add_message(format!("{gav}: recorded {count} {artifact_type} file(s)"));
        }
        Ok(response)
    }

    async fn delete(&self, gav: &Gav) -> Result<RefreshResponse> {
        Ok(RefreshResponse::message(format!("{gav}: removed")))
    }
}
