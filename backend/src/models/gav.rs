//! Project coordinates (group / artifact / version).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{AppError, Result};

/// Sentinel version used for records that cover every version of an artifact.
pub const ALL_VERSIONS: &str = "all";

/// Separator used when deriving a default parent event id from coordinates.
pub const PARENT_EVENT_SEPARATOR: &str = "_";

/// A `groupId:artifactId:versionId` coordinate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Gav {
    pub group_id: String,
    pub artifact_id: String,
    pub version_id: String,
}

impl Gav {
    pub fn new(
        group_id: impl Into<String>,
        artifact_id: impl Into<String>,
        version_id: impl Into<String>,
    ) -> Self {
        Self {
            group_id: group_id.into(),
            artifact_id: artifact_id.into(),
            version_id: version_id.into(),
        }
    }

    /// Scope key covering all versions of `group_id:artifact_id`.
    pub fn all_versions(group_id: impl Into<String>, artifact_id: impl Into<String>) -> Self {
        Self::new(group_id, artifact_id, ALL_VERSIONS)
    }

    pub fn is_all_versions(&self) -> bool {
        self.version_id == ALL_VERSIONS
    }

    /// Validate all three parts of the coordinate.
    pub fn validate(&self) -> Result<()> {
        validate_part("groupId", &self.group_id)?;
        validate_part("artifactId", &self.artifact_id)?;
        validate_part("versionId", &self.version_id)
    }

    /// The project this version belongs to.
    pub fn project_key(&self) -> (String, String) {
        (self.group_id.clone(), self.artifact_id.clone())
    }

    pub fn same_project(&self, group_id: &str, artifact_id: &str) -> bool {
        self.group_id == group_id && self.artifact_id == artifact_id
    }
}

impl fmt::Display for Gav {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.group_id, self.artifact_id, self.version_id)
    }
}

impl FromStr for Gav {
    type Err = AppError;

    /// Parse `group:artifact:version`.
    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.trim().splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(g), Some(a), Some(v)) => {
                let gav = Gav::new(g, a, v);
                gav.validate()?;
                Ok(gav)
            }
            _ => Err(AppError::Validation(format!(
                "'{s}' is not a groupId:artifactId:versionId coordinate"
            ))),
        }
    }
}

/// Validate a single coordinate part: non-empty, no whitespace and none of
/// the characters used as separators in keys and repository paths.
pub fn validate_part(name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(AppError::Validation(format!("{name} is required")));
    }
    if value
        .chars()
        .any(|c| c.is_whitespace() || c == ':' || c == '/' || c == '\\')
    {
        return Err(AppError::Validation(format!(
            "{name} '{value}' contains invalid characters"
        )));
    }
    Ok(())
}

/// Parent event id helpers.
pub struct ParentEvent;

impl ParentEvent {
    /// Id used for the root of a cascade when the caller did not supply one.
    pub fn default_id(gav: &Gav) -> String {
        [
            gav.group_id.as_str(),
            gav.artifact_id.as_str(),
            gav.version_id.as_str(),
        ]
        .join(PARENT_EVENT_SEPARATOR)
    }

    /// The supplied parent id, or the coordinate-derived default.
    pub fn resolve(gav: &Gav, parent_event_id: Option<&str>) -> String {
        match parent_event_id {
            Some(id) if !id.trim().is_empty() => id.to_string(),
            _ => Self::default_id(gav),
        }
    }
}

/// A project known to the depot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectCoordinates {
    pub project_id: String,
    pub group_id: String,
    pub artifact_id: String,
}

impl ProjectCoordinates {
    pub fn new(
        project_id: impl Into<String>,
        group_id: impl Into<String>,
        artifact_id: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            group_id: group_id.into(),
            artifact_id: artifact_id.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_part("projectId", &self.project_id)?;
        validate_part("groupId", &self.group_id)?;
        validate_part("artifactId", &self.artifact_id)
    }

    pub fn version(&self, version_id: impl Into<String>) -> Gav {
        Gav::new(&self.group_id, &self.artifact_id, version_id)
    }
}
