//! Deployment state machine as a pure transition function.
//!
//! ```text
//! Pending -> Building -> Launching -> Running
//!    |          |           |           |-- crash, fallback exists --> RolledBack
//!    |          |           |           |-- crash, no fallback ------> Failed
//!    |          |           |-- launch failed -------------------------> Failed
//!    |          |-- build failed ----------------------------------------> Failed
//!    +----------+-----------+-----------+-- cancel / retire -----------> Terminated
//!    +----------+-----------+-----------+-- interrupted by restart ----> Failed
//! ```

use agentship_state::DeploymentStatus;

use super::error::{ControllerError, Result};

/// What happened to a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    StartBuild,
    BuildSucceeded,
    BuildFailed,
    LaunchReady,
    LaunchFailed,
    /// Crash after Running; `fallback` is whether a healthy predecessor is serving
    Crashed { fallback: bool },
    /// Explicit cancel or agent termination
    Cancel,
    /// Replaced by a promoted successor, or retired by reconciliation
    Retire,
    /// Work lost across a controller restart
    Interrupted,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::StartBuild => "start_build",
            Trigger::BuildSucceeded => "build_succeeded",
            Trigger::BuildFailed => "build_failed",
            Trigger::LaunchReady => "launch_ready",
            Trigger::LaunchFailed => "launch_failed",
            Trigger::Crashed { .. } => "crashed",
            Trigger::Cancel => "cancel",
            Trigger::Retire => "retire",
            Trigger::Interrupted => "interrupted",
        }
    }
}

/// Next status for `trigger`, or `InvalidTransition`.
///
/// Terminal statuses accept nothing, and no trigger skips an intermediate
/// status.
pub fn transition(from: DeploymentStatus, trigger: Trigger) -> Result<DeploymentStatus> {
    use DeploymentStatus::*;

    let to = match (from, trigger) {
        (Pending, Trigger::StartBuild) => Building,
        (Building, Trigger::BuildSucceeded) => Launching,
        (Building, Trigger::BuildFailed) => Failed,
        (Launching, Trigger::LaunchReady) => Running,
        (Launching, Trigger::LaunchFailed) => Failed,
        (Running, Trigger::Crashed { fallback: true }) => RolledBack,
        (Running, Trigger::Crashed { fallback: false }) => Failed,
        (Running, Trigger::Retire) => Terminated,
        (Pending | Building | Launching | Running, Trigger::Cancel) => Terminated,
        (Pending | Building | Launching | Running, Trigger::Interrupted) => Failed,
        _ => {
            return Err(ControllerError::InvalidTransition {
                from,
                trigger: trigger.as_str().to_string(),
            })
        }
    };
    Ok(to)
}
