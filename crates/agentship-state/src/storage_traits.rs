//! Storage trait definitions for agentship
//!
//! These traits define the persistence seams of the controller:
//! - `CasStore`: Content-addressed blob storage (put/get by digest)
//! - `ArtifactCatalog`: Metadata of built artifacts
//! - `DeploymentStore`: Agents and their deployment records
//! - `EventLog`: Per-deployment, sequence-ordered event persistence
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use std::collections::BTreeMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// CasStore — Content-Addressed Storage
// ---------------------------------------------------------------------------

/// Content digest (SHA-256 hex string).
///
/// The inner field is private to guarantee the string is always valid
/// lowercase hex produced by `from_bytes` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl From<ContentDigest> for String {
    fn from(d: ContentDigest) -> Self {
        d.0
    }
}

impl FromStr for ContentDigest {
    type Err = StorageError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ContentDigest::try_from(s.to_string())
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content-addressed blob store.
///
/// Guarantees:
/// - `put(data)` always returns the SHA-256 digest of `data`.
/// - `get(digest)` returns the exact bytes previously stored.
/// - Same content always yields the same digest (deduplication).
/// - A blob becomes visible to `get` only after it is completely written.
#[async_trait]
pub trait CasStore: Send + Sync {
    /// Store bytes and return their content digest.
    async fn put(&self, data: &[u8]) -> StorageResult<ContentDigest>;

    /// Retrieve bytes by digest. Returns `StorageError::NotFound` if absent.
    async fn get(&self, digest: &ContentDigest) -> StorageResult<Vec<u8>>;

    /// Check whether a digest exists in the store.
    async fn exists(&self, digest: &ContentDigest) -> StorageResult<bool>;

    /// Delete content by digest. No-op if absent.
    async fn delete(&self, digest: &ContentDigest) -> StorageResult<()>;
}

// ---------------------------------------------------------------------------
// ArtifactCatalog — built artifact metadata
// ---------------------------------------------------------------------------

/// Metadata of an immutable built artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    /// Digest of the image manifest blob (the artifact key)
    pub hash: ContentDigest,
    /// Size of the image manifest in bytes
    pub size: u64,
    /// Digest of the captured build log blob
    pub build_log: ContentDigest,
    /// Framework the artifact was built for
    pub framework: String,
    /// Source snapshot the artifact was built from
    pub source: ContentDigest,
    /// Cache key over (source, resolved framework)
    pub build_key: ContentDigest,
    pub created_at: DateTime<Utc>,
}

/// Artifact metadata catalog.
///
/// Semantics:
/// - `record` is idempotent: recording an existing hash keeps the first record.
/// - records are never updated or deleted.
#[async_trait]
pub trait ArtifactCatalog: Send + Sync {
    /// Record an artifact, returning the stored record.
    async fn record(&self, artifact: &ArtifactRecord) -> StorageResult<ArtifactRecord>;

    /// Fetch an artifact by hash. Returns `StorageError::NotFound` if absent.
    async fn get(&self, hash: &ContentDigest) -> StorageResult<ArtifactRecord>;

    /// Find a previously built artifact for a build cache key.
    async fn find_by_build_key(
        &self,
        build_key: &ContentDigest,
    ) -> StorageResult<Option<ArtifactRecord>>;

    /// All recorded artifacts, newest first.
    async fn list(&self) -> StorageResult<Vec<ArtifactRecord>>;
}

// ---------------------------------------------------------------------------
// DeploymentStore — agents and deployments
// ---------------------------------------------------------------------------

/// Identifier of a user-owned agent (`agt_` + 16 hex chars).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    /// Generate a new random agent id.
    pub fn generate() -> Self {
        let raw = uuid::Uuid::new_v4().simple().to_string();
        AgentId(format!("agt_{}", &raw[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pre-validated owner identity attached by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(pub String);

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for one deployment attempt
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeploymentId(pub String);

impl DeploymentId {
    /// Generate a new random DeploymentId
    pub fn new() -> Self {
        DeploymentId(format!("dpl_{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for DeploymentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resource limits requested for a running agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory ceiling in MiB
    pub memory_mb: u32,
    /// CPU quota in millicores
    pub cpu_millis: u32,
    /// Number of instances to run (at least 1)
    #[serde(default = "default_replicas")]
    pub replicas: u32,
}

fn default_replicas() -> u32 {
    1
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 512,
            cpu_millis: 1000,
            replicas: 1,
        }
    }
}

/// What the owner wants running for an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredSpec {
    /// Digest of the source snapshot blob
    pub source: ContentDigest,
    /// Framework hint, resolved by the build engine
    pub framework_hint: String,
    pub limits: ResourceLimits,
    /// Environment variables passed to the runtime
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// A user-owned logical service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: AgentId,
    pub owner_id: OwnerId,
    pub name: String,
    pub description: Option<String>,
    /// Spec of the most recent deployment request
    pub desired: Option<DesiredSpec>,
    /// Deployment currently serving this agent
    pub active_deployment: Option<DeploymentId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set once the agent is explicitly terminated
    pub terminated_at: Option<DateTime<Utc>>,
}

impl AgentRecord {
    /// Create a new agent record with no deployments.
    pub fn new(
        agent_id: AgentId,
        owner_id: OwnerId,
        name: impl Into<String>,
        description: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            agent_id,
            owner_id,
            name: name.into(),
            description,
            desired: None,
            active_deployment: None,
            created_at: now,
            updated_at: now,
            terminated_at: None,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated_at.is_some()
    }

    /// Coarse status label used for listing and filtering.
    pub fn status_label(&self) -> &'static str {
        if self.is_terminated() {
            "terminated"
        } else if self.active_deployment.is_some() {
            "serving"
        } else {
            "idle"
        }
    }
}

/// Status of a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Building,
    Launching,
    Running,
    Failed,
    RolledBack,
    Terminated,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Building => "building",
            DeploymentStatus::Launching => "launching",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::RolledBack => "rolled_back",
            DeploymentStatus::Terminated => "terminated",
        }
    }

    /// Terminal records are history; they never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Failed | DeploymentStatus::RolledBack | DeploymentStatus::Terminated
        )
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeploymentStatus::Pending),
            "building" => Ok(DeploymentStatus::Building),
            "launching" => Ok(DeploymentStatus::Launching),
            "running" => Ok(DeploymentStatus::Running),
            "failed" => Ok(DeploymentStatus::Failed),
            "rolled_back" => Ok(DeploymentStatus::RolledBack),
            "terminated" => Ok(DeploymentStatus::Terminated),
            other => Err(StorageError::Backend(format!(
                "unknown deployment status: {other}"
            ))),
        }
    }
}

/// One attempt to realize an agent's desired spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub deployment_id: DeploymentId,
    /// Back-reference to the owning agent
    pub agent_id: AgentId,
    pub source: ContentDigest,
    pub framework_hint: String,
    pub limits: ResourceLimits,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Hash of the built artifact, set once the build succeeds
    pub artifact: Option<ContentDigest>,
    /// Build log digest (present for successful and failed builds)
    pub build_log: Option<ContentDigest>,
    /// Runtime backend handle while resources exist
    pub backend_handle: Option<String>,
    pub status: DeploymentStatus,
    /// Deployment that was serving when this one was admitted
    pub predecessor: Option<DeploymentId>,
    /// Set once the deployment survived its probation window
    pub promoted: bool,
    /// Human-readable reason for terminal states
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeploymentRecord {
    /// Create a new pending deployment for `agent_id`.
    pub fn new(agent_id: AgentId, spec: &DesiredSpec, predecessor: Option<DeploymentId>) -> Self {
        let now = Utc::now();
        Self {
            deployment_id: DeploymentId::new(),
            agent_id,
            source: spec.source.clone(),
            framework_hint: spec.framework_hint.clone(),
            limits: spec.limits,
            env: spec.env.clone(),
            artifact: None,
            build_log: None,
            backend_handle: None,
            status: DeploymentStatus::Pending,
            predecessor,
            promoted: false,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Pending, building, launching, or running but not yet promoted.
    pub fn is_rollout_in_flight(&self) -> bool {
        match self.status {
            DeploymentStatus::Pending | DeploymentStatus::Building | DeploymentStatus::Launching => {
                true
            }
            DeploymentStatus::Running => !self.promoted,
            _ => false,
        }
    }
}

/// Agent and deployment persistence.
///
/// Guarantees:
/// - Deployment ids are unique.
/// - A deployment stored in a terminal status is never modified again.
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    /// Insert or replace an agent record.
    async fn put_agent(&self, agent: &AgentRecord) -> StorageResult<()>;

    /// Fetch an agent. Returns `StorageError::AgentNotFound` if absent.
    async fn get_agent(&self, agent_id: &AgentId) -> StorageResult<AgentRecord>;

    /// List agents, optionally filtered by owner, newest first.
    async fn list_agents(&self, owner: Option<&OwnerId>) -> StorageResult<Vec<AgentRecord>>;

    /// Insert a new deployment. Fails if the id already exists.
    async fn insert_deployment(&self, deployment: &DeploymentRecord) -> StorageResult<()>;

    /// Replace a deployment record. Fails if the stored record is terminal.
    async fn update_deployment(&self, deployment: &DeploymentRecord) -> StorageResult<()>;

    /// Fetch a deployment. Returns `StorageError::DeploymentNotFound` if absent.
    async fn get_deployment(&self, deployment_id: &DeploymentId)
        -> StorageResult<DeploymentRecord>;

    /// All deployments of an agent, oldest first.
    async fn list_deployments(&self, agent_id: &AgentId) -> StorageResult<Vec<DeploymentRecord>>;

    /// All deployments in a non-terminal status, oldest first.
    async fn list_live_deployments(&self) -> StorageResult<Vec<DeploymentRecord>>;
}

// ---------------------------------------------------------------------------
// EventLog — ordered deployment events
// ---------------------------------------------------------------------------

/// A single persisted event of a deployment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub deployment_id: DeploymentId,
    /// Monotonic, gap-free sequence number within the deployment (1-based)
    pub seq: u64,
    /// Event kind (e.g. "status_changed", "crash_detected")
    pub kind: String,
    /// Event payload
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Append-only event log.
///
/// Guarantees:
/// - `(deployment_id, seq)` is unique.
/// - `history` returns events ordered by `seq`.
/// - Events are never updated or deleted.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append an event. Fails with `DuplicateEvent` if the seq is taken.
    async fn append(&self, event: &EventRecord) -> StorageResult<()>;

    /// Events of a deployment with `seq >= from_seq`, ordered by seq.
    async fn history(
        &self,
        deployment_id: &DeploymentId,
        from_seq: u64,
    ) -> StorageResult<Vec<EventRecord>>;

    /// Highest recorded seq for a deployment, 0 when none.
    async fn last_seq(&self, deployment_id: &DeploymentId) -> StorageResult<u64>;
}
