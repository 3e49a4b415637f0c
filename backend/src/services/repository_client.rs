//! Access to the authoritative artifact repository.
//!
//! The `ArtifactRepository` trait is what the engine consumes; the
//! filesystem implementation reads a Maven-style directory layout:
//!
//! ```text
//! <root>/<group as path>/<artifact>/<version>/<artifact type>/**
//! <root>/<group as path>/<artifact>/<version>/dependencies.json
//! ```

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::error::{AppError, Result};
use crate::models::{ArtifactFile, Gav, ProjectCoordinates};

/// File listing the direct dependencies of a version, as a JSON array of
/// `group:artifact:version` strings.
pub const DEPENDENCIES_FILE: &str = "dependencies.json";

/// Read access to the authoritative source of published versions.
#[async_trait]
pub trait ArtifactRepository: Send + Sync {
    /// All published version ids of `group_id:artifact_id`.
    /// Fails with `NotFound` if the coordinates are unknown.
    async fn find_versions(&self, group_id: &str, artifact_id: &str) -> Result<Vec<String>>;

    /// Files of one artifact type for a version. An unknown version is
    /// `NotFound`; a known version without that type yields an empty list.
    async fn find_files(&self, artifact_type: &str, gav: &Gav) -> Result<Vec<ArtifactFile>>;

    /// Direct dependencies declared by a version.
    async fn find_dependencies(&self, gav: &Gav) -> Result<Vec<Gav>>;
}

/// Repository backed by a local directory tree.
pub struct FilesystemRepository {
    root: PathBuf,
}

impl FilesystemRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn artifact_dir(&self, group_id: &str, artifact_id: &str) -> PathBuf {
        let mut dir = self.root.clone();
        for part in group_id.split('.') {
            dir.push(part);
        }
        dir.push(artifact_id);
        dir
    }

    fn version_dir(&self, gav: &Gav) -> PathBuf {
        self.artifact_dir(&gav.group_id, &gav.artifact_id)
            .join(&gav.version_id)
    }

    /// Find every `group:artifact` directory in the tree.
    ///
    /// A directory counts as an artifact when one of its children (a
    /// version) holds a directory named after one of `artifact_types`.
    pub async fn discover_projects(
        &self,
        artifact_types: &[String],
    ) -> Result<Vec<ProjectCoordinates>> {
        let mut projects = Vec::new();
        let mut stack = vec![self.root.clone()];

        while let Some(dir) = stack.pop() {
            let children = subdirectories(&dir).await?;
            let mut is_artifact = false;
            for child in &children {
                for artifact_type in artifact_types {
                    if fs::metadata(child.join(artifact_type))
                        .await
                        .map(|m| m.is_dir())
                        .unwrap_or(false)
                    {
                        is_artifact = true;
                        break;
                    }
                }
                if is_artifact {
                    break;
                }
            }

            if is_artifact {
                if let Some(project) = self.coordinates_for(&dir) {
                    projects.push(project);
                }
            } else {
                stack.extend(children);
            }
        }

        projects.sort_by(|a, b| a.project_id.cmp(&b.project_id));
        Ok(projects)
    }

    fn coordinates_for(&self, artifact_dir: &Path) -> Option<ProjectCoordinates> {
        let relative = artifact_dir.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        let (artifact_id, group) = parts.split_last()?;
        if group.is_empty() {
            return None;
        }
        let group_id = group.join(".");
        Some(ProjectCoordinates::new(
            format!("{group_id}.{artifact_id}"),
            group_id,
            artifact_id.clone(),
        ))
    }
}

#[async_trait]
impl ArtifactRepository for FilesystemRepository {
    async fn find_versions(&self, group_id: &str, artifact_id: &str) -> Result<Vec<String>> {
        let dir = self.artifact_dir(group_id, artifact_id);
        let mut versions: Vec<String> = subdirectories(&dir)
            .await
            .map_err(|e| not_found_as(e, format!("{group_id}:{artifact_id}")))?
            .into_iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();
        versions.sort();
        Ok(versions)
    }

    async fn find_files(&self, artifact_type: &str, gav: &Gav) -> Result<Vec<ArtifactFile>> {
        let version_dir = self.version_dir(gav);
        if !is_dir(&version_dir).await? {
            return Err(AppError::NotFound(gav.to_string()));
        }

        let type_dir = version_dir.join(artifact_type);
        if !is_dir(&type_dir).await? {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        let mut stack = vec![type_dir];
        while let Some(dir) = stack.pop() {
            let mut entries = fs::read_dir(&dir).await.map_err(transient)?;
            while let Some(entry) = entries.next_entry().await.map_err(transient)? {
                let path = entry.path();
                let file_type = entry.file_type().await.map_err(transient)?;
                if file_type.is_dir() {
                    stack.push(path);
                } else if file_type.is_file() {
                    let content = fs::read(&path).await.map_err(transient)?;
                    files.push(ArtifactFile {
                        artifact_type: artifact_type.to_string(),
                        path: self.relative_path(&path),
                        checksum: format!("{:x}", Sha256::digest(&content)),
                        size_bytes: content.len() as u64,
                    });
                }
            }
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    async fn find_dependencies(&self, gav: &Gav) -> Result<Vec<Gav>> {
        let version_dir = self.version_dir(gav);
        if !is_dir(&version_dir).await? {
            return Err(AppError::NotFound(gav.to_string()));
        }

        let raw = match fs::read(version_dir.join(DEPENDENCIES_FILE)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(transient(e)),
        };
        let coordinates: Vec<String> = serde_json::from_slice(&raw)?;
        coordinates.iter().map(|c| c.parse()).collect()
    }
}

impl FilesystemRepository {
    fn relative_path(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }
}

async fn is_dir(path: &Path) -> Result<bool> {
    match fs::metadata(path).await {
        Ok(meta) => Ok(meta.is_dir()),
        Err(e) if e.kind() == IoErrorKind::NotFound => Ok(false),
        Err(e) => Err(transient(e)),
    }
}

async fn subdirectories(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn not_found_as(e: std::io::Error, what: String) -> AppError {
    if e.kind() == IoErrorKind::NotFound {
        AppError::NotFound(what)
    } else {
        transient(e)
    }
}

fn transient(e: std::io::Error) -> AppError {
    AppError::TransientIo(e.to_string())
}
