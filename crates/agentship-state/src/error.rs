//! Error types for agentship-state

use thiserror::Error;

/// Errors raised while connecting to or preparing a backend
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),

    /// Filesystem error while preparing local storage
    #[error("Storage directory unavailable: {0}")]
    Io(#[from] std::io::Error),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

/// Errors returned by the storage traits
#[derive(Error, Debug)]
pub enum StorageError {
    /// No blob or artifact exists for the digest
    #[error("content not found: {digest}")]
    NotFound { digest: String },

    /// Digest string is not 64 hex characters
    #[error("invalid digest: {digest}")]
    InvalidDigest { digest: String },

    #[error("agent not found: {agent_id}")]
    AgentNotFound { agent_id: String },

    #[error("deployment not found: {deployment_id}")]
    DeploymentNotFound { deployment_id: String },

    #[error("deployment already exists: {deployment_id}")]
    DuplicateDeployment { deployment_id: String },

    /// Terminal deployment records never change
    #[error("deployment {deployment_id} is {status} and can no longer be updated")]
    ImmutableDeployment {
        deployment_id: String,
        status: String,
    },

    /// The sequence number is already taken for this deployment
    #[error("event {seq} already recorded for deployment {deployment_id}")]
    DuplicateEvent { deployment_id: String, seq: u64 },

    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Io(_) | StorageError::Backend(_))
    }
}
