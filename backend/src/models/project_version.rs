//! Cache catalog entries and the checksum ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::gav::Gav;
use super::version::is_snapshot;

/// A cached project version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectVersionData {
    pub gav: Gav,
    pub project_id: Option<String>,
    /// Soft-delete marker: hidden from version queries, kept for audit
    pub evicted: bool,
    /// Present in the cache but no longer reported by the repository
    pub deprecated: bool,
    /// Paths of the files extracted for this version
    pub files: Vec<String>,
    /// Transitive dependency report
    pub dependencies: Vec<Gav>,
    pub version_metadata: serde_json::Value,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl ProjectVersionData {
    pub fn new(gav: Gav, now: DateTime<Utc>) -> Self {
        Self {
            gav,
            project_id: None,
            evicted: false,
            deprecated: false,
            files: Vec::new(),
            dependencies: Vec::new(),
            version_metadata: serde_json::Value::Null,
            created: now,
            updated: now,
        }
    }

    pub fn is_snapshot(&self) -> bool {
        is_snapshot(&self.gav.version_id)
    }

    /// Visible to "latest / available versions" queries.
    pub fn is_available(&self) -> bool {
        !self.evicted
    }
}

/// A file reported by the artifact repository for one version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactFile {
    pub artifact_type: String,
    /// Repository-relative path, unique across the repository
    pub path: String,
    /// Lowercase hex SHA-256 of the content
    pub checksum: String,
    pub size_bytes: u64,
}

/// Checksum ledger entry: the content hash last processed for `path`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDetail {
    pub path: String,
    pub checksum: String,
    /// Owning version, so a version purge can drop its entries
    pub gav: Gav,
    pub updated: DateTime<Utc>,
}

impl ArtifactDetail {
    pub fn from_file(gav: &Gav, file: &ArtifactFile, now: DateTime<Utc>) -> Self {
        Self {
            path: file.path.clone(),
            checksum: file.checksum.clone(),
            gav: gav.clone(),
            updated: now,
        }
    }
}
