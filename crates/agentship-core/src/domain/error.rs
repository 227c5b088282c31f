//! Controller error taxonomy.

use agentship_build::BuildError;
use agentship_state::{DeploymentRecord, DeploymentStatus, StorageError};

use crate::runtime::BackendError;

/// Errors returned by controller operations.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    /// Another rollout for the agent is in flight; resubmit once it resolves
    #[error("agent {agent_id} already has rollout {in_flight} in flight")]
    Conflict { agent_id: String, in_flight: String },

    #[error("build error: {0}")]
    Build(#[from] BuildError),

    /// The backend rejected the artifact or it crashed before becoming healthy
    #[error("launch of {deployment_id} failed: {reason}")]
    Launch {
        deployment_id: String,
        reason: String,
    },

    /// Post-Running crash with no healthy predecessor to fall back to
    #[error("deployment {deployment_id} crashed: {reason}")]
    RuntimeCrash {
        deployment_id: String,
        reason: String,
    },

    #[error("not found: {what}")]
    NotFound { what: String },

    #[error("agent {agent_id} is terminated")]
    AgentTerminated { agent_id: String },

    #[error("invalid transition from {from} on {trigger}")]
    InvalidTransition {
        from: DeploymentStatus,
        trigger: String,
    },

    #[error("storage error: {0}")]
    Storage(StorageError),

    #[error("runtime backend error: {0}")]
    Backend(#[from] BackendError),
}

impl From<StorageError> for ControllerError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::AgentNotFound { agent_id } => ControllerError::NotFound {
                what: format!("agent {agent_id}"),
            },
            StorageError::DeploymentNotFound { deployment_id } => ControllerError::NotFound {
                what: format!("deployment {deployment_id}"),
            },
            StorageError::NotFound { digest } => ControllerError::NotFound {
                what: format!("artifact {digest}"),
            },
            other => ControllerError::Storage(other),
        }
    }
}

impl ControllerError {
    /// Typed error for a deployment that ended `Failed`, rebuilt from the
    /// `<Kind>: <detail>` failure reason recorded on it.
    pub fn from_failed(record: &DeploymentRecord) -> Option<Self> {
        if record.status != DeploymentStatus::Failed {
            return None;
        }
        let reason = record.failure_reason.as_deref().unwrap_or_default();
        let (kind, detail) = reason.split_once(": ").unwrap_or((reason, ""));
        let deployment_id = record.deployment_id.to_string();

        let err = match kind {
            "LaunchError" => ControllerError::Launch {
                deployment_id,
                reason: detail.to_string(),
            },
            "RuntimeCrash" => ControllerError::RuntimeCrash {
                deployment_id,
                reason: detail.to_string(),
            },
            "InvalidSource" => ControllerError::Build(BuildError::InvalidSource {
                reason: detail
                    .strip_prefix("invalid source: ")
                    .unwrap_or(detail)
                    .to_string(),
            }),
            "UnsupportedFramework" => ControllerError::Build(BuildError::UnsupportedFramework {
                hint: record.framework_hint.clone(),
            }),
            "BuildTimeout" => ControllerError::Build(BuildError::BuildTimeout {
                limit_secs: detail
                    .trim_start_matches("build exceeded ")
                    .trim_end_matches("s budget")
                    .parse()
                    .unwrap_or_default(),
            }),
            "BuildFailed" => ControllerError::Build(BuildError::BuildFailed {
                reason: detail
                    .strip_prefix("build failed: ")
                    .unwrap_or(detail)
                    .to_string(),
                log_ref: record.build_log.clone(),
            }),
            _ => ControllerError::Launch {
                deployment_id,
                reason: reason.to_string(),
            },
        };
        Some(err)
    }
}

/// Result type for controller operations.
pub type Result<T> = std::result::Result<T, ControllerError>;
