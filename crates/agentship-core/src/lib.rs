//! agentship-core: deployment controller for agent workloads
//!
//! Takes an agent's source snapshot and framework hint, builds an artifact,
//! launches it on a runtime backend, watches its health, rolls back on
//! post-launch crashes, and exposes an ordered event stream per deployment.
//!
//! ## Key Components
//!
//! - `Controller`: per-agent serialized rollouts, rollback, cancel, terminate, scale, reconcile
//! - `RuntimeBackend`: where deployments run (`ProcessBackend`, `MemoryBackend`)
//! - `EventBus`: persisted, gap-free, live event stream per deployment
//! - `domain`: deployment state machine, typed events, errors

pub mod config;
pub mod controller;
pub mod domain;
pub mod events;
pub mod metrics;
pub mod obs;
pub mod runtime;
pub mod telemetry;

pub use config::ControllerConfig;
pub use controller::{
    CancelOutcome, Controller, DeploymentRequest, MonitorReport, ReconcileReport, StatusSnapshot,
};
pub use domain::{
    ends_deployment, transition, ControllerError, DeploymentEvent, Result, Trigger,
};
pub use events::{EventBus, EventStream};
pub use runtime::{
    BackendError, BackendHandle, HealthReport, HealthState, LaunchRequest, MemoryBackend,
    ProcessBackend, ResourceUsage, RuntimeBackend,
};
