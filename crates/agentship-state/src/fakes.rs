//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryCasStore`, `MemoryArtifactCatalog`, `MemoryDeploymentStore`
//! and `MemoryEventLog` that satisfy the trait contracts without any external
//! dependencies.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// MemoryCasStore
// ---------------------------------------------------------------------------

/// In-memory content-addressed store backed by a `HashMap<digest, bytes>`.
///
/// `fail_next_puts(n)` makes the next `n` puts fail with a transient
/// backend error, for exercising retry paths.
#[derive(Debug, Default)]
pub struct MemoryCasStore {
    store: Mutex<HashMap<String, Vec<u8>>>,
    failing_puts: AtomicU32,
}

impl MemoryCasStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` calls to `put`.
    pub fn fail_next_puts(&self, n: u32) {
        self.failing_puts.store(n, Ordering::SeqCst);
    }

    /// Number of blobs currently stored.
    pub fn len(&self) -> usize {
        self.store.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CasStore for MemoryCasStore {
    async fn put(&self, data: &[u8]) -> StorageResult<ContentDigest> {
        let pending = self.failing_puts.load(Ordering::SeqCst);
        if pending > 0 {
            self.failing_puts.store(pending - 1, Ordering::SeqCst);
            return Err(StorageError::Backend("injected put failure".into()));
        }
        let digest = ContentDigest::from_bytes(data);
        let mut store = self.store.lock().unwrap();
        store.insert(digest.as_str().to_string(), data.to_vec());
        Ok(digest)
    }

    async fn get(&self, digest: &ContentDigest) -> StorageResult<Vec<u8>> {
        let store = self.store.lock().unwrap();
        store
            .get(digest.as_str())
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                digest: digest.as_str().to_string(),
            })
    }

    async fn exists(&self, digest: &ContentDigest) -> StorageResult<bool> {
        let store = self.store.lock().unwrap();
        Ok(store.contains_key(digest.as_str()))
    }

    async fn delete(&self, digest: &ContentDigest) -> StorageResult<()> {
        let mut store = self.store.lock().unwrap();
        store.remove(digest.as_str());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryArtifactCatalog
// ---------------------------------------------------------------------------

/// In-memory artifact catalog keyed by artifact hash.
#[derive(Debug, Default)]
pub struct MemoryArtifactCatalog {
    artifacts: Mutex<HashMap<String, ArtifactRecord>>,
}

impl MemoryArtifactCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactCatalog for MemoryArtifactCatalog {
    async fn record(&self, artifact: &ArtifactRecord) -> StorageResult<ArtifactRecord> {
        let mut artifacts = self.artifacts.lock().unwrap();
        let stored = artifacts
            .entry(artifact.hash.as_str().to_string())
            .or_insert_with(|| artifact.clone());
        Ok(stored.clone())
    }

    async fn get(&self, hash: &ContentDigest) -> StorageResult<ArtifactRecord> {
        let artifacts = self.artifacts.lock().unwrap();
        artifacts
            .get(hash.as_str())
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                digest: hash.as_str().to_string(),
            })
    }

    async fn find_by_build_key(
        &self,
        build_key: &ContentDigest,
    ) -> StorageResult<Option<ArtifactRecord>> {
        let artifacts = self.artifacts.lock().unwrap();
        Ok(artifacts
            .values()
            .filter(|a| &a.build_key == build_key)
            .min_by_key(|a| a.created_at)
            .cloned())
    }

    async fn list(&self) -> StorageResult<Vec<ArtifactRecord>> {
        let artifacts = self.artifacts.lock().unwrap();
        let mut all: Vec<ArtifactRecord> = artifacts.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all)
    }
}

// ---------------------------------------------------------------------------
// MemoryDeploymentStore
// ---------------------------------------------------------------------------

/// In-memory agent and deployment store.
///
/// Deployments are kept in insertion order so listings are oldest first.
#[derive(Debug, Default)]
pub struct MemoryDeploymentStore {
    agents: Mutex<HashMap<String, AgentRecord>>,
    deployments: Mutex<Vec<DeploymentRecord>>,
}

impl MemoryDeploymentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeploymentStore for MemoryDeploymentStore {
    async fn put_agent(&self, agent: &AgentRecord) -> StorageResult<()> {
        let mut agents = self.agents.lock().unwrap();
        agents.insert(agent.agent_id.0.clone(), agent.clone());
        Ok(())
    }

    async fn get_agent(&self, agent_id: &AgentId) -> StorageResult<AgentRecord> {
        let agents = self.agents.lock().unwrap();
        agents
            .get(agent_id.as_str())
            .cloned()
            .ok_or_else(|| StorageError::AgentNotFound {
                agent_id: agent_id.0.clone(),
            })
    }

    async fn list_agents(&self, owner: Option<&OwnerId>) -> StorageResult<Vec<AgentRecord>> {
        let agents = self.agents.lock().unwrap();
        let mut list: Vec<AgentRecord> = agents
            .values()
            .filter(|a| owner.map_or(true, |o| &a.owner_id == o))
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(list)
    }

    async fn insert_deployment(&self, deployment: &DeploymentRecord) -> StorageResult<()> {
        let mut deployments = self.deployments.lock().unwrap();
        if deployments
            .iter()
            .any(|d| d.deployment_id == deployment.deployment_id)
        {
            return Err(StorageError::DuplicateDeployment {
                deployment_id: deployment.deployment_id.0.clone(),
            });
        }
        deployments.push(deployment.clone());
        Ok(())
    }

    async fn update_deployment(&self, deployment: &DeploymentRecord) -> StorageResult<()> {
        let mut deployments = self.deployments.lock().unwrap();
        let existing = deployments
            .iter_mut()
            .find(|d| d.deployment_id == deployment.deployment_id)
            .ok_or_else(|| StorageError::DeploymentNotFound {
                deployment_id: deployment.deployment_id.0.clone(),
            })?;
        if existing.status.is_terminal() {
            return Err(StorageError::ImmutableDeployment {
                deployment_id: existing.deployment_id.0.clone(),
                status: existing.status.as_str().to_string(),
            });
        }
        *existing = deployment.clone();
        Ok(())
    }

    async fn get_deployment(
        &self,
        deployment_id: &DeploymentId,
    ) -> StorageResult<DeploymentRecord> {
        let deployments = self.deployments.lock().unwrap();
        deployments
            .iter()
            .find(|d| &d.deployment_id == deployment_id)
            .cloned()
            .ok_or_else(|| StorageError::DeploymentNotFound {
                deployment_id: deployment_id.0.clone(),
            })
    }

    async fn list_deployments(&self, agent_id: &AgentId) -> StorageResult<Vec<DeploymentRecord>> {
        let deployments = self.deployments.lock().unwrap();
        Ok(deployments
            .iter()
            .filter(|d| &d.agent_id == agent_id)
            .cloned()
            .collect())
    }

    async fn list_live_deployments(&self) -> StorageResult<Vec<DeploymentRecord>> {
        let deployments = self.deployments.lock().unwrap();
        Ok(deployments
            .iter()
            .filter(|d| !d.status.is_terminal())
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// MemoryEventLog
// ---------------------------------------------------------------------------

/// In-memory event log backed by `deployment id -> (seq -> event)`.
#[derive(Debug, Default)]
pub struct MemoryEventLog {
    events: Mutex<HashMap<String, BTreeMap<u64, EventRecord>>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, event: &EventRecord) -> StorageResult<()> {
        let mut events = self.events.lock().unwrap();
        let log = events.entry(event.deployment_id.0.clone()).or_default();
        if log.contains_key(&event.seq) {
            return Err(StorageError::DuplicateEvent {
                deployment_id: event.deployment_id.0.clone(),
                seq: event.seq,
            });
        }
        log.insert(event.seq, event.clone());
        Ok(())
    }

    async fn history(
        &self,
        deployment_id: &DeploymentId,
        from_seq: u64,
    ) -> StorageResult<Vec<EventRecord>> {
        let events = self.events.lock().unwrap();
        Ok(events
            .get(deployment_id.as_str())
            .map(|log| log.range(from_seq..).map(|(_, e)| e.clone()).collect())
            .unwrap_or_default())
    }

    async fn last_seq(&self, deployment_id: &DeploymentId) -> StorageResult<u64> {
        let events = self.events.lock().unwrap();
        Ok(events
            .get(deployment_id.as_str())
            .and_then(|log| log.keys().next_back().copied())
            .unwrap_or(0))
    }
}
