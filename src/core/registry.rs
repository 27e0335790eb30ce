//! Persistent pipeline registry backed by a single JSON document.
//!
//! The registry is the single source of truth for every pipeline's build
//! history, available artifacts and active process. It is constructed once,
//! shared via `Arc`, and serializes all writers through one async mutex:
//! each update reads the current in-memory document, applies its change and
//! rewrites the whole file before the next update is admitted.
//!
//! The document is written via temp-file + rename so a crashed write can
//! never leave a partial document behind.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::domain::{BranchInfo, BuildStatus, Pipeline};

/// Current schema version of the persisted document
const SCHEMA_VERSION: u32 = 1;

/// Errors from registry operations
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Unknown pipeline: {0}")]
    UnknownPipeline(String),

    #[error("State document is corrupt: {0}")]
    StateCorrupt(String),

    #[error("Registry is degraded after a failed write; reload required")]
    Degraded,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Versioned envelope for the persisted pipeline collection
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateDocument {
    version: u32,
    pipelines: Vec<Pipeline>,
}

impl StateDocument {
    fn empty() -> Self {
        Self {
            version: SCHEMA_VERSION,
            pipelines: Vec::new(),
        }
    }
}

/// In-memory registry state guarded by the writer mutex
#[derive(Debug)]
struct Inner {
    doc: StateDocument,

    /// Set when a durable write failed; all further writes are rejected
    /// until an explicit reload so memory and disk cannot drift silently.
    degraded: bool,
}

/// The pipeline state store
#[derive(Debug)]
pub struct Registry {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl Registry {
    /// Load (or create) the registry document and validate it.
    ///
    /// `seed_names` are the configured pipelines; any of them missing from
    /// the document get a fresh record. A legacy bare-array document is
    /// migrated to the versioned envelope on the spot.
    pub async fn open(path: PathBuf, seed_names: &[String]) -> Result<Self, RegistryError> {
        let mut doc = if tokio::fs::try_exists(&path).await? {
            let raw = tokio::fs::read_to_string(&path).await?;
            parse_document(&raw)?
        } else {
            info!(path = %path.display(), "No state document found, starting empty");
            StateDocument::empty()
        };

        validate(&doc)?;

        let mut changed = false;
        for name in seed_names {
            if !doc.pipelines.iter().any(|p| &p.pipeline_name == name) {
                doc.pipelines.push(Pipeline::new(name.clone()));
                changed = true;
            }
        }

        let registry = Self {
            path,
            inner: Mutex::new(Inner {
                doc,
                degraded: false,
            }),
        };

        if changed {
            let inner = registry.inner.lock().await;
            registry.persist(&inner.doc).await?;
        }

        Ok(registry)
    }

    /// Get a pipeline record by name
    pub async fn get(&self, name: &str) -> Result<Pipeline, RegistryError> {
        let inner = self.inner.lock().await;
        inner
            .doc
            .pipelines
            .iter()
            .find(|p| p.pipeline_name == name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownPipeline(name.to_string()))
    }

    /// Clone the full pipeline collection
    pub async fn snapshot(&self) -> Vec<Pipeline> {
        self.inner.lock().await.doc.pipelines.clone()
    }

    /// Register a newly built artifact branch
    pub async fn push_branch(&self, name: &str, branch: BranchInfo) -> Result<(), RegistryError> {
        self.update(name, |p| p.available_branches.push(branch))
            .await
    }

    /// Record the active artifact and its process in one update.
    ///
    /// Branch, resources path and PID always move together so a reader can
    /// never observe a branch name paired with a stale process id.
    pub async fn set_active(
        &self,
        name: &str,
        branch: &str,
        resources_path: &str,
        pid: u32,
    ) -> Result<(), RegistryError> {
        self.update(name, |p| {
            p.active_branch = branch.to_string();
            p.active_resources_path = resources_path.to_string();
            p.active_pid = pid;
        })
        .await
    }

    /// Repoint the active resources without a process (static artifacts)
    pub async fn set_active_resources(
        &self,
        name: &str,
        branch: &str,
        resources_path: &str,
    ) -> Result<(), RegistryError> {
        self.update(name, |p| {
            p.active_branch = branch.to_string();
            p.active_resources_path = resources_path.to_string();
        })
        .await
    }

    /// Replace the build-status entry for the commit, or append a new one
    pub async fn upsert_build_status(
        &self,
        name: &str,
        status: BuildStatus,
    ) -> Result<(), RegistryError> {
        self.update(name, |p| {
            match p
                .build_status
                .iter_mut()
                .find(|s| s.commit_id == status.commit_id)
            {
                Some(existing) => *existing = status,
                None => p.build_status.push(status),
            }
        })
        .await
    }

    /// Re-read the document from disk, clearing a degraded registry
    pub async fn reload(&self) -> Result<(), RegistryError> {
        let raw = tokio::fs::read_to_string(&self.path).await?;
        let doc = parse_document(&raw)?;
        validate(&doc)?;

        let mut inner = self.inner.lock().await;
        inner.doc = doc;
        inner.degraded = false;
        info!(path = %self.path.display(), "Registry reloaded");
        Ok(())
    }

    /// Apply a mutation to one pipeline and durably rewrite the document.
    ///
    /// Holds the writer lock across read-modify-write-persist, which is what
    /// gives updates their total order. The mutation runs on a scratch copy
    /// and the in-memory document only advances once the rewrite is durable,
    /// so readers never observe state that is not on disk.
    async fn update<F>(&self, name: &str, mutate: F) -> Result<(), RegistryError>
    where
        F: FnOnce(&mut Pipeline),
    {
        let mut inner = self.inner.lock().await;

        if inner.degraded {
            return Err(RegistryError::Degraded);
        }

        let mut doc = inner.doc.clone();
        let pipeline = doc
            .pipelines
            .iter_mut()
            .find(|p| p.pipeline_name == name)
            .ok_or_else(|| RegistryError::UnknownPipeline(name.to_string()))?;

        mutate(pipeline);

        if let Err(e) = self.persist(&doc).await {
            // The on-disk state is now uncertain; stop accepting writes
            // until an explicit reload re-establishes it.
            inner.degraded = true;
            warn!(error = %e, "State write failed, registry degraded");
            return Err(e);
        }

        inner.doc = doc;
        Ok(())
    }

    /// Write the whole document atomically (temp file + rename)
    async fn persist(&self, doc: &StateDocument) -> Result<(), RegistryError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_string_pretty(doc)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json.as_bytes()).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        Ok(())
    }
}

/// Parse the document, accepting the legacy bare-array shape
fn parse_document(raw: &str) -> Result<StateDocument, RegistryError> {
    if let Ok(doc) = serde_json::from_str::<StateDocument>(raw) {
        return Ok(doc);
    }

    // Older deployments persisted the pipeline array directly.
    if let Ok(pipelines) = serde_json::from_str::<Vec<Pipeline>>(raw) {
        info!("Migrating legacy state document to versioned schema");
        return Ok(StateDocument {
            version: SCHEMA_VERSION,
            pipelines,
        });
    }

    Err(RegistryError::StateCorrupt(
        "document is neither a versioned state document nor a legacy pipeline array".to_string(),
    ))
}

/// Reject documents the rest of the system cannot reason about
fn validate(doc: &StateDocument) -> Result<(), RegistryError> {
    if doc.version != SCHEMA_VERSION {
        return Err(RegistryError::StateCorrupt(format!(
            "unsupported schema version {}",
            doc.version
        )));
    }

    for (i, pipeline) in doc.pipelines.iter().enumerate() {
        if pipeline.pipeline_name.is_empty() {
            return Err(RegistryError::StateCorrupt(format!(
                "pipeline at index {} has an empty name",
                i
            )));
        }

        let duplicates = doc
            .pipelines
            .iter()
            .filter(|p| p.pipeline_name == pipeline.pipeline_name)
            .count();
        if duplicates > 1 {
            return Err(RegistryError::StateCorrupt(format!(
                "duplicate pipeline name: {}",
                pipeline.pipeline_name
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::BuildState;
    use tempfile::TempDir;

    fn state_path(temp: &TempDir) -> PathBuf {
        temp.path().join("pipeline_state.json")
    }

    #[tokio::test]
    async fn test_open_seeds_missing_pipelines() {
        let temp = TempDir::new().unwrap();
        let registry = Registry::open(state_path(&temp), &["demo".to_string()])
            .await
            .unwrap();

        let pipeline = registry.get("demo").await.unwrap();
        assert_eq!(pipeline.pipeline_name, "demo");
        assert_eq!(pipeline.active_pid, 0);
        assert!(pipeline.available_branches.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_pipeline() {
        let temp = TempDir::new().unwrap();
        let registry = Registry::open(state_path(&temp), &[]).await.unwrap();

        let err = registry.get("ghost").await.unwrap_err();
        assert!(matches!(err, RegistryError::UnknownPipeline(_)));

        let err = registry
            .set_active("ghost", "main", "/tmp", 42)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownPipeline(_)));
    }

    #[tokio::test]
    async fn test_legacy_array_document_migrates() {
        let temp = TempDir::new().unwrap();
        let path = state_path(&temp);

        let legacy = serde_json::json!([{
            "pipelineName": "str-service",
            "activeBranch": "abc123",
            "activeResourcesPath": "/srv/str/abc123.jar",
            "activePID": 4242,
            "availableBranches": [{"name": "abc123", "path": "/srv/str/abc123.jar"}],
            "buildStatus": []
        }]);
        tokio::fs::write(&path, legacy.to_string()).await.unwrap();

        let registry = Registry::open(path.clone(), &[]).await.unwrap();
        let pipeline = registry.get("str-service").await.unwrap();
        assert_eq!(pipeline.active_pid, 4242);
        assert_eq!(pipeline.available_branches.len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_document_is_fatal() {
        let temp = TempDir::new().unwrap();
        let path = state_path(&temp);
        tokio::fs::write(&path, "{not json at all").await.unwrap();

        let err = Registry::open(path, &[]).await.unwrap_err();
        assert!(matches!(err, RegistryError::StateCorrupt(_)));
    }

    #[tokio::test]
    async fn test_duplicate_names_rejected() {
        let temp = TempDir::new().unwrap();
        let path = state_path(&temp);

        let doc = serde_json::json!({
            "version": 1,
            "pipelines": [
                {"pipelineName": "demo"},
                {"pipelineName": "demo"}
            ]
        });
        tokio::fs::write(&path, doc.to_string()).await.unwrap();

        let err = Registry::open(path, &[]).await.unwrap_err();
        assert!(matches!(err, RegistryError::StateCorrupt(_)));
    }

    #[tokio::test]
    async fn test_upsert_build_status_replaces_by_commit() {
        let temp = TempDir::new().unwrap();
        let registry = Registry::open(state_path(&temp), &["demo".to_string()])
            .await
            .unwrap();

        registry
            .upsert_build_status(
                "demo",
                BuildStatus::new("abc123", "main", BuildState::InProgress, 10),
            )
            .await
            .unwrap();
        registry
            .upsert_build_status(
                "demo",
                BuildStatus::new("abc123", "main", BuildState::Success, 100),
            )
            .await
            .unwrap();

        let pipeline = registry.get("demo").await.unwrap();
        assert_eq!(pipeline.build_status.len(), 1);
        assert_eq!(pipeline.build_status[0].status, BuildState::Success);
        assert_eq!(pipeline.build_status[0].progression, 100);
    }

    #[tokio::test]
    async fn test_failed_write_is_not_visible_in_memory() {
        let temp = TempDir::new().unwrap();
        let path = state_path(&temp);
        let registry = Registry::open(path.clone(), &["demo".to_string()])
            .await
            .unwrap();

        // A directory at the state path makes the atomic rename fail
        tokio::fs::remove_file(&path).await.unwrap();
        tokio::fs::create_dir(&path).await.unwrap();

        registry
            .push_branch(
                "demo",
                BranchInfo {
                    name: "abc123".to_string(),
                    path: "/srv/demo/abc123.jar".to_string(),
                },
            )
            .await
            .unwrap_err();

        // Readers see the last durable state, not the failed mutation
        let pipeline = registry.get("demo").await.unwrap();
        assert!(pipeline.available_branches.is_empty());
        assert!(registry.snapshot().await[0].available_branches.is_empty());
    }

    #[tokio::test]
    async fn test_set_active_updates_the_triple() {
        let temp = TempDir::new().unwrap();
        let registry = Registry::open(state_path(&temp), &["demo".to_string()])
            .await
            .unwrap();

        registry
            .set_active("demo", "abc123", "/srv/demo/abc123.jar", 777)
            .await
            .unwrap();

        let pipeline = registry.get("demo").await.unwrap();
        assert_eq!(pipeline.active_branch, "abc123");
        assert_eq!(pipeline.active_resources_path, "/srv/demo/abc123.jar");
        assert_eq!(pipeline.active_pid, 777);
    }
}
