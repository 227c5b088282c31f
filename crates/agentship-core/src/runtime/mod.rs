//! Runtime backends: where deployments actually run.
//!
//! The controller only talks to [`RuntimeBackend`]. Two implementations ship:
//! - [`MemoryBackend`]: scriptable in-process fake for tests and dry runs
//! - [`ProcessBackend`]: local OS processes materialized from the artifact

pub mod memory;
pub mod process;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use agentship_state::{ContentDigest, DeploymentId, ResourceLimits, StorageError};

pub use memory::MemoryBackend;
pub use process::ProcessBackend;

/// Opaque reference to resources owned by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendHandle(pub String);

impl BackendHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BackendHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything a backend needs to start a deployment.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchRequest {
    pub deployment_id: DeploymentId,
    /// Digest of the image manifest
    pub artifact: ContentDigest,
    pub limits: ResourceLimits,
    pub env: BTreeMap<String, String>,
}

/// Liveness of launched resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Running,
    Crashed,
    /// Exited on its own; agents are long-running, so this counts as a crash
    Exited,
}

/// Point-in-time resource consumption. Fields are `None` when unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub memory_mb: Option<u64>,
    pub cpu_millis: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub state: HealthState,
    pub usage: ResourceUsage,
    pub detail: Option<String>,
}

impl HealthReport {
    pub fn running(usage: ResourceUsage) -> Self {
        Self {
            state: HealthState::Running,
            usage,
            detail: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == HealthState::Running
    }

    /// Human-readable description of a non-running state.
    pub fn describe(&self) -> String {
        let state = match self.state {
            HealthState::Running => "running",
            HealthState::Crashed => "crashed",
            HealthState::Exited => "exited",
        };
        match &self.detail {
            Some(detail) => format!("{state}: {detail}"),
            None => state.to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The backend refused to start the artifact
    #[error("launch rejected: {0}")]
    Rejected(String),

    #[error("unknown backend handle: {0}")]
    UnknownHandle(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("artifact storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Runtime seam of the controller.
///
/// Contract:
/// - `launch` returns once resources exist; health is judged separately.
/// - `terminate` is idempotent for handles the backend has already released.
/// - `running` lists every handle the backend still owns, including ones
///   launched before a controller restart.
#[async_trait]
pub trait RuntimeBackend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    async fn launch(&self, request: &LaunchRequest) -> Result<BackendHandle, BackendError>;

    async fn health_check(&self, handle: &BackendHandle) -> Result<HealthReport, BackendError>;

    async fn terminate(&self, handle: &BackendHandle) -> Result<(), BackendError>;

    async fn running(&self) -> Result<Vec<BackendHandle>, BackendError>;
}
