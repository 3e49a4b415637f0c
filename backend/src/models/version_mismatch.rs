//! Reconciliation report records.

use serde::{Deserialize, Serialize};

/// Drift between the repository and the cache for one project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionMismatch {
    pub project_id: String,
    pub group_id: String,
    pub artifact_id: String,
    pub versions_not_in_cache: Vec<String>,
    pub versions_not_in_repo: Vec<String>,
    pub errors: Vec<String>,
}

impl VersionMismatch {
    pub fn has_drift(&self) -> bool {
        !self.versions_not_in_cache.is_empty() || !self.versions_not_in_repo.is_empty()
    }

    /// Worth reporting: drift or a captured error.
    pub fn is_reportable(&self) -> bool {
        self.has_drift() || !self.errors.is_empty()
    }
}
