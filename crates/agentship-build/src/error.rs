//! Build errors.

use agentship_state::ContentDigest;
use thiserror::Error;

/// Why a build produced no artifact.
///
/// Builds are never retried internally; only CAS writes are.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BuildError {
    /// The snapshot is missing from the store or cannot be decoded
    #[error("invalid source: {reason}")]
    InvalidSource { reason: String },

    #[error("unsupported framework: {hint}")]
    UnsupportedFramework { hint: String },

    /// Packaging exceeded the wall-clock budget
    #[error("build exceeded {limit_secs}s budget")]
    BuildTimeout { limit_secs: u64 },

    /// Packaging or storing the output failed; the log is kept when it could be stored
    #[error("build failed: {reason}")]
    BuildFailed {
        reason: String,
        log_ref: Option<ContentDigest>,
    },

    #[error("build cancelled")]
    Cancelled,
}

impl BuildError {
    /// Stable kind label used as the failure reason prefix on deployments.
    pub fn kind(&self) -> &'static str {
        match self {
            BuildError::InvalidSource { .. } => "InvalidSource",
            BuildError::UnsupportedFramework { .. } => "UnsupportedFramework",
            BuildError::BuildTimeout { .. } => "BuildTimeout",
            BuildError::BuildFailed { .. } => "BuildFailed",
            BuildError::Cancelled => "Cancelled",
        }
    }

    pub fn log_ref(&self) -> Option<&ContentDigest> {
        match self {
            BuildError::BuildFailed { log_ref, .. } => log_ref.as_ref(),
            _ => None,
        }
    }
}
