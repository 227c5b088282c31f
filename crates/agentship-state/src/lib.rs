//! agentship-state: persistence layer for agentship
//!
//! This crate owns every byte the controller keeps across restarts:
//! content-addressed blobs (source snapshots, image manifests, build logs),
//! artifact metadata, agent and deployment records, and the per-deployment
//! event log.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: atomic blob writes, immutable terminal records, gap-free event
//! sequences.
//!
//! ## Key Components
//!
//! - `CasStore` / `FsCasStore`: content-addressed blob storage
//! - `ArtifactCatalog`: metadata for built artifacts, keyed by content hash
//! - `DeploymentStore`: agents and deployment records
//! - `EventLog`: append-only ordered events per deployment
//! - `SurrealStore`: SurrealDB backend for the catalog, store and log

mod error;
pub mod fakes;
mod fs_cas;
mod migrations;
mod schema;
pub mod storage_traits;
pub mod surreal_store;

pub use error::{StateError, StorageError};
pub use fs_cas::FsCasStore;
pub use storage_traits::{
    AgentId, AgentRecord, ArtifactCatalog, ArtifactRecord, CasStore, ContentDigest,
    DeploymentId, DeploymentRecord, DeploymentStatus, DeploymentStore, DesiredSpec, EventLog,
    EventRecord, OwnerId, ResourceLimits, StorageResult,
};
pub use surreal_store::{CloudConfig, SurrealStore};

/// Result type for connection-level operations
pub type Result<T> = std::result::Result<T, StateError>;
