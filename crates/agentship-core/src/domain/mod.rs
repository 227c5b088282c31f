//! Domain models for the deployment controller.
//!
//! - `DeploymentEvent`: typed events written to a deployment's log
//! - `lifecycle`: the deployment state machine
//! - `ControllerError`: errors surfaced by controller operations

pub mod error;
pub mod event;
pub mod lifecycle;

pub use error::{ControllerError, Result};
pub use event::{ends_deployment, DeploymentEvent};
pub use lifecycle::{transition, Trigger};
