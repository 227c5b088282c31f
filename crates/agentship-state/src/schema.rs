//! Row definitions for the agentship SurrealDB tables
//!
//! Tables:
//! - agents: Registered agents and their active deployment pointer
//! - deployments: One row per deployment attempt
//! - events: Per-deployment ordered events
//! - artifacts: Built artifact metadata
//!
//! Rows hold plain strings for ids and digests; conversion to the typed
//! records in `storage_traits` happens in `surreal_store`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::storage_traits::{
    AgentId, AgentRecord, ArtifactRecord, ContentDigest, DeploymentId, DeploymentRecord,
    DesiredSpec, EventRecord, OwnerId, ResourceLimits, StorageResult,
};

/// Module for serializing chrono DateTime to SurrealDB datetime format
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// Module for serializing optional chrono DateTime to SurrealDB datetime format
mod surreal_datetime_opt {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match date {
            Some(d) => {
                let sd = SurrealDatetime::from(*d);
                serde::Serialize::serialize(&Some(sd), serializer)
            }
            None => serde::Serialize::serialize(&None::<SurrealDatetime>, serializer),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = Option::<SurrealDatetime>::deserialize(deserializer)?;
        Ok(sd.map(DateTime::from))
    }
}

fn one() -> u32 {
    1
}

fn digest_opt(value: Option<String>) -> StorageResult<Option<ContentDigest>> {
    value.map(ContentDigest::try_from).transpose()
}

// ---------------------------------------------------------------------------
// agents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    pub agent_id: String,
    pub owner_id: String,
    pub name: String,
    pub description: Option<String>,
    /// Desired spec as JSON
    pub desired: Option<serde_json::Value>,
    pub active_deployment: Option<String>,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "surreal_datetime")]
    pub updated_at: DateTime<Utc>,
    #[serde(default, with = "surreal_datetime_opt")]
    pub terminated_at: Option<DateTime<Utc>>,
}

impl AgentRow {
    pub fn from_record(agent: &AgentRecord) -> StorageResult<Self> {
        let desired = agent
            .desired
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        Ok(Self {
            id: None,
            agent_id: agent.agent_id.0.clone(),
            owner_id: agent.owner_id.0.clone(),
            name: agent.name.clone(),
            description: agent.description.clone(),
            desired,
            active_deployment: agent.active_deployment.as_ref().map(|d| d.0.clone()),
            created_at: agent.created_at,
            updated_at: agent.updated_at,
            terminated_at: agent.terminated_at,
        })
    }

    pub fn into_record(self) -> StorageResult<AgentRecord> {
        let desired: Option<DesiredSpec> = self
            .desired
            .map(serde_json::from_value)
            .transpose()?;
        Ok(AgentRecord {
            agent_id: AgentId(self.agent_id),
            owner_id: OwnerId(self.owner_id),
            name: self.name,
            description: self.description,
            desired,
            active_deployment: self.active_deployment.map(DeploymentId),
            created_at: self.created_at,
            updated_at: self.updated_at,
            terminated_at: self.terminated_at,
        })
    }
}

// ---------------------------------------------------------------------------
// deployments
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    pub deployment_id: String,
    pub agent_id: String,
    pub source: String,
    pub framework_hint: String,
    pub memory_mb: u32,
    pub cpu_millis: u32,
    #[serde(default = "one")]
    pub replicas: u32,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub artifact: Option<String>,
    pub build_log: Option<String>,
    pub backend_handle: Option<String>,
    /// "pending" | "building" | "launching" | "running" | "failed" | "rolled_back" | "terminated"
    pub status: String,
    pub predecessor: Option<String>,
    pub promoted: bool,
    pub failure_reason: Option<String>,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "surreal_datetime")]
    pub updated_at: DateTime<Utc>,
}

impl DeploymentRow {
    pub fn from_record(d: &DeploymentRecord) -> Self {
        Self {
            id: None,
            deployment_id: d.deployment_id.0.clone(),
            agent_id: d.agent_id.0.clone(),
            source: d.source.as_str().to_string(),
            framework_hint: d.framework_hint.clone(),
            memory_mb: d.limits.memory_mb,
            cpu_millis: d.limits.cpu_millis,
            replicas: d.limits.replicas,
            env: d.env.clone(),
            artifact: d.artifact.as_ref().map(|a| a.as_str().to_string()),
            build_log: d.build_log.as_ref().map(|a| a.as_str().to_string()),
            backend_handle: d.backend_handle.clone(),
            status: d.status.as_str().to_string(),
            predecessor: d.predecessor.as_ref().map(|p| p.0.clone()),
            promoted: d.promoted,
            failure_reason: d.failure_reason.clone(),
            created_at: d.created_at,
            updated_at: d.updated_at,
        }
    }

    pub fn into_record(self) -> StorageResult<DeploymentRecord> {
        Ok(DeploymentRecord {
            deployment_id: DeploymentId(self.deployment_id),
            agent_id: AgentId(self.agent_id),
            source: ContentDigest::try_from(self.source)?,
            framework_hint: self.framework_hint,
            limits: ResourceLimits {
                memory_mb: self.memory_mb,
                cpu_millis: self.cpu_millis,
                replicas: self.replicas,
            },
            env: self.env,
            artifact: digest_opt(self.artifact)?,
            build_log: digest_opt(self.build_log)?,
            backend_handle: self.backend_handle,
            status: self.status.parse()?,
            predecessor: self.predecessor.map(DeploymentId),
            promoted: self.promoted,
            failure_reason: self.failure_reason,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

// ---------------------------------------------------------------------------
// events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    pub deployment_id: String,
    /// Gap-free sequence number within the deployment (1-indexed)
    pub seq: u64,
    pub kind: String,
    pub payload: serde_json::Value,
    #[serde(with = "surreal_datetime")]
    pub timestamp: DateTime<Utc>,
}

impl EventRow {
    pub fn from_record(e: &EventRecord) -> Self {
        Self {
            id: None,
            deployment_id: e.deployment_id.0.clone(),
            seq: e.seq,
            kind: e.kind.clone(),
            payload: e.payload.clone(),
            timestamp: e.timestamp,
        }
    }

    pub fn into_record(self) -> EventRecord {
        EventRecord {
            deployment_id: DeploymentId(self.deployment_id),
            seq: self.seq,
            kind: self.kind,
            payload: self.payload,
            timestamp: self.timestamp,
        }
    }
}

// ---------------------------------------------------------------------------
// artifacts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    pub hash: String,
    pub size: u64,
    pub build_log: String,
    pub framework: String,
    pub source: String,
    pub build_key: String,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
}

impl ArtifactRow {
    pub fn from_record(a: &ArtifactRecord) -> Self {
        Self {
            id: None,
            hash: a.hash.as_str().to_string(),
            size: a.size,
            build_log: a.build_log.as_str().to_string(),
            framework: a.framework.clone(),
            source: a.source.as_str().to_string(),
            build_key: a.build_key.as_str().to_string(),
            created_at: a.created_at,
        }
    }

    pub fn into_record(self) -> Result<ArtifactRecord, StorageError> {
        Ok(ArtifactRecord {
            hash: ContentDigest::try_from(self.hash)?,
            size: self.size,
            build_log: ContentDigest::try_from(self.build_log)?,
            framework: self.framework,
            source: ContentDigest::try_from(self.source)?,
            build_key: ContentDigest::try_from(self.build_key)?,
            created_at: self.created_at,
        })
    }
}
