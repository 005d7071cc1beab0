//! Versioned artifact storage.
//!
//! Versions are append-only: creating starts at 1, every patch appends
//! latest + 1. [`ArtifactService`] serializes patches per artifact id so two
//! concurrent edits cannot both read version N and both write N + 1.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use super::database::AgentDatabase;
use super::errors::AgentError;
use super::types::{Artifact, ArtifactDraft, ArtifactPatch};

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store a new artifact as version 1 under a fresh id.
    async fn create(&self, draft: ArtifactDraft) -> Result<Artifact, AgentError>;

    /// Latest version.
    async fn get(&self, artifact_id: &str) -> Result<Option<Artifact>, AgentError>;

    async fn get_version(&self, artifact_id: &str, version: u32) -> Result<Option<Artifact>, AgentError>;

    /// All versions, oldest first. Empty when the artifact does not exist.
    async fn versions(&self, artifact_id: &str) -> Result<Vec<Artifact>, AgentError>;

    /// Append latest + 1. Callers must hold the id's lock (see [`ArtifactService`]).
    async fn append_version(&self, artifact_id: &str, patch: ArtifactPatch) -> Result<Artifact, AgentError>;
}

fn new_artifact(draft: ArtifactDraft) -> Artifact {
    Artifact {
        artifact_id: uuid::Uuid::new_v4().to_string(),
        artifact_type: draft.artifact_type,
        content_format: draft.content_format,
        content: draft.content,
        version: 1,
        resources: draft.resources,
        created_at: chrono::Utc::now().to_rfc3339(),
    }
}

fn not_found(artifact_id: &str) -> AgentError {
    AgentError::ArtifactNotFound {
        artifact_id: artifact_id.to_string(),
    }
}

// ─── In-memory ──────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryArtifactStore {
    /// id → versions, index 0 is version 1
    artifacts: RwLock<HashMap<String, Vec<Artifact>>>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn create(&self, draft: ArtifactDraft) -> Result<Artifact, AgentError> {
        let artifact = new_artifact(draft);
        self.artifacts
            .write()
            .await
            .insert(artifact.artifact_id.clone(), vec![artifact.clone()]);
        Ok(artifact)
    }

    async fn get(&self, artifact_id: &str) -> Result<Option<Artifact>, AgentError> {
        Ok(self
            .artifacts
            .read()
            .await
            .get(artifact_id)
            .and_then(|v| v.last().cloned()))
    }

    async fn get_version(&self, artifact_id: &str, version: u32) -> Result<Option<Artifact>, AgentError> {
        Ok(self
            .artifacts
            .read()
            .await
            .get(artifact_id)
            .and_then(|v| v.iter().find(|a| a.version == version).cloned()))
    }

    async fn versions(&self, artifact_id: &str) -> Result<Vec<Artifact>, AgentError> {
        Ok(self
            .artifacts
            .read()
            .await
            .get(artifact_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn append_version(&self, artifact_id: &str, patch: ArtifactPatch) -> Result<Artifact, AgentError> {
        let mut artifacts = self.artifacts.write().await;
        let versions = artifacts.get_mut(artifact_id).ok_or_else(|| not_found(artifact_id))?;
        let latest = versions.last().ok_or_else(|| not_found(artifact_id))?;
        let next = Artifact {
            artifact_id: latest.artifact_id.clone(),
            artifact_type: latest.artifact_type.clone(),
            content_format: latest.content_format.clone(),
            content: patch.content,
            version: latest.version + 1,
            resources: patch.resources.unwrap_or_else(|| latest.resources.clone()),
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        versions.push(next.clone());
        Ok(next)
    }
}

// ─── SQLite ─────────────────────────────────────────────────────────────────

pub struct SqliteArtifactStore {
    db: Mutex<AgentDatabase>,
}

impl SqliteArtifactStore {
    pub fn new(db: AgentDatabase) -> Self {
        Self { db: Mutex::new(db) }
    }

    pub fn open(path: &str) -> Result<Self, AgentError> {
        Ok(Self::new(AgentDatabase::open(path)?))
    }
}

#[async_trait]
impl ArtifactStore for SqliteArtifactStore {
    async fn create(&self, draft: ArtifactDraft) -> Result<Artifact, AgentError> {
        let artifact = new_artifact(draft);
        self.db.lock().await.insert_artifact(&artifact)?;
        Ok(artifact)
    }

    async fn get(&self, artifact_id: &str) -> Result<Option<Artifact>, AgentError> {
        self.db.lock().await.get_latest_artifact(artifact_id)
    }

    async fn get_version(&self, artifact_id: &str, version: u32) -> Result<Option<Artifact>, AgentError> {
        self.db.lock().await.get_artifact_version(artifact_id, version)
    }

    async fn versions(&self, artifact_id: &str) -> Result<Vec<Artifact>, AgentError> {
        self.db.lock().await.list_artifact_versions(artifact_id)
    }

    async fn append_version(&self, artifact_id: &str, patch: ArtifactPatch) -> Result<Artifact, AgentError> {
        self.db
            .lock()
            .await
            .append_artifact_version(artifact_id, &patch.content, patch.resources.as_deref())?
            .ok_or_else(|| not_found(artifact_id))
    }
}

// ─── Service ────────────────────────────────────────────────────────────────

/// Artifact store plus a per-id lock map for read-modify-write patches.
pub struct ArtifactService {
    store: Arc<dyn ArtifactStore>,
    locks: LockMap,
}

impl ArtifactService {
    pub fn new(store: Arc<dyn ArtifactStore>) -> Self {
        Self {
            store,
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    pub async fn create(&self, draft: ArtifactDraft) -> Result<Artifact, AgentError> {
        self.store.create(draft).await
    }

    /// Latest version, or `ArtifactNotFound`.
    pub async fn get(&self, artifact_id: &str) -> Result<Artifact, AgentError> {
        self.store
            .get(artifact_id)
            .await?
            .ok_or_else(|| not_found(artifact_id))
    }

    /// All versions, or `ArtifactNotFound` when there are none.
    pub async fn versions(&self, artifact_id: &str) -> Result<Vec<Artifact>, AgentError> {
        let versions = self.store.versions(artifact_id).await?;
        if versions.is_empty() {
            return Err(not_found(artifact_id));
        }
        Ok(versions)
    }

    fn lease(&self, artifact_id: &str) -> Result<LockLease<'_>, AgentError> {
        let mut locks = self.locks.lock().map_err(|e| AgentError::StoreError {
            reason: format!("artifact lock map poisoned: {e}"),
        })?;
        let lock = locks
            .entry(artifact_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        Ok(LockLease {
            locks: &self.locks,
            artifact_id: artifact_id.to_string(),
            lock,
        })
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or_default()
    }

    /// Read the latest version, compute a patch from it, and append it, all
    /// while holding the id's lock.
    pub async fn patch_with<F, Fut>(&self, artifact_id: &str, compute: F) -> Result<Artifact, AgentError>
    where
        F: FnOnce(Artifact) -> Fut + Send,
        Fut: Future<Output = Result<ArtifactPatch, AgentError>> + Send,
    {
        let lease = self.lease(artifact_id)?;
        let _guard = lease.lock.lock().await;

        let current = self.get(artifact_id).await?;
        let patch = compute(current).await?;
        let next = self.store.append_version(artifact_id, patch).await?;
        tracing::info!(
            artifact_id = %artifact_id,
            version = next.version,
            "artifact patched"
        );
        Ok(next)
    }
}

type LockMap = std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>;

/// One holder's share of an id's lock. The last holder out removes the
/// entry, so the map only holds ids with a patch in flight.
struct LockLease<'a> {
    locks: &'a LockMap,
    artifact_id: String,
    lock: Arc<Mutex<()>>,
}

impl Drop for LockLease<'_> {
    fn drop(&mut self) {
        let Ok(mut locks) = self.locks.lock() else {
            return;
        };
        // Clones are only taken under the map lock: two means the map and us.
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.artifact_id);
        }
    }
}
