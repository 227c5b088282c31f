//! Deployment controller.
//!
//! Owns desired-vs-actual state per agent. Every mutation of an agent's
//! deployments happens while holding that agent's lane (an async mutex), so
//! different agents proceed in parallel while one agent's transitions are
//! strictly ordered. Admission additionally claims a per-agent rollout slot
//! without waiting, which is what turns concurrent requests into conflicts.
//!
//! Submodules:
//! - `rollout`: request, build, launch, probation, promotion
//! - `rollback`: crash handling
//! - `cancel`: cancel and terminate
//! - `monitor`: health observation of promoted deployments
//! - `recovery`: reconciliation after a restart

mod cancel;
mod monitor;
mod recovery;
mod rollback;
mod rollout;

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use agentship_build::BuildEngine;
use agentship_state::{
    AgentId, AgentRecord, DeploymentId, DeploymentRecord, DeploymentStatus, DeploymentStore,
    EventLog, EventRecord, OwnerId,
};

use crate::config::ControllerConfig;
use crate::domain::{transition, ControllerError, DeploymentEvent, Result, Trigger};
use crate::events::{EventBus, EventStream};
use crate::obs;
use crate::runtime::{BackendError, BackendHandle, HealthReport, ResourceUsage, RuntimeBackend};

pub use cancel::CancelOutcome;
pub use monitor::MonitorReport;
pub use recovery::ReconcileReport;
pub use rollout::DeploymentRequest;

/// Point-in-time view of a deployment.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub deployment: DeploymentRecord,
    /// Whether this deployment currently serves its agent
    pub active: bool,
    /// Seq of the latest event, 0 when none
    pub last_seq: u64,
}

#[derive(Clone)]
struct Rollout {
    deployment_id: DeploymentId,
    cancel: CancellationToken,
}

/// Outcome of one health check.
enum Liveness {
    Healthy(ResourceUsage),
    /// Crashed, exited, or the backend no longer knows the handle
    Down(String),
    /// Could not tell; try again later
    Unknown(String),
}

struct Inner {
    store: Arc<dyn DeploymentStore>,
    bus: EventBus,
    builder: BuildEngine,
    backend: Arc<dyn RuntimeBackend>,
    config: ControllerConfig,
    lanes: DashMap<AgentId, Arc<Mutex<()>>>,
    rollouts: DashMap<AgentId, Rollout>,
}

/// Handle to the controller. Cheap to clone.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

impl Controller {
    /// Controller without reconciliation. Use [`Controller::start`] when the
    /// store may hold state from an earlier run.
    pub fn new(
        store: Arc<dyn DeploymentStore>,
        event_log: Arc<dyn EventLog>,
        builder: BuildEngine,
        backend: Arc<dyn RuntimeBackend>,
        config: ControllerConfig,
    ) -> Self {
        let bus = EventBus::new(event_log, config.event_buffer);
        Self {
            inner: Arc::new(Inner {
                store,
                bus,
                builder,
                backend,
                config,
                lanes: DashMap::new(),
                rollouts: DashMap::new(),
            }),
        }
    }

    /// Build a controller and reconcile persisted state with the backend.
    pub async fn start(
        store: Arc<dyn DeploymentStore>,
        event_log: Arc<dyn EventLog>,
        builder: BuildEngine,
        backend: Arc<dyn RuntimeBackend>,
        config: ControllerConfig,
    ) -> Result<Self> {
        let controller = Self::new(store, event_log, builder, backend, config);
        let report = controller.reconcile().await?;
        tracing::info!(
            backend = controller.inner.backend.name(),
            interrupted = report.interrupted.len(),
            lost = report.lost.len(),
            adopted = report.adopted.len(),
            retired = report.retired.len(),
            orphans = report.orphans_terminated.len(),
            "controller started"
        );
        Ok(controller)
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.inner.config
    }

    pub fn builder(&self) -> &BuildEngine {
        &self.inner.builder
    }

    pub fn backend(&self) -> &Arc<dyn RuntimeBackend> {
        &self.inner.backend
    }

    // -- queries -----------------------------------------------------------

    /// Create an agent without deploying it.
    pub async fn register_agent(
        &self,
        owner_id: OwnerId,
        name: &str,
        description: Option<String>,
    ) -> Result<AgentRecord> {
        let agent = AgentRecord::new(AgentId::generate(), owner_id, name, description);
        self.inner.store.put_agent(&agent).await?;
        tracing::info!(agent_id = %agent.agent_id, name = %agent.name, "agent registered");
        Ok(agent)
    }

    pub async fn get_agent(&self, agent_id: &AgentId) -> Result<AgentRecord> {
        Ok(self.inner.store.get_agent(agent_id).await?)
    }

    /// Agents, newest first, optionally filtered by owner and status label
    /// (`idle`, `serving`, `terminated`).
    pub async fn list_agents(
        &self,
        owner: Option<&OwnerId>,
        status: Option<&str>,
    ) -> Result<Vec<AgentRecord>> {
        let agents = self.inner.store.list_agents(owner).await?;
        Ok(match status {
            Some(label) => agents
                .into_iter()
                .filter(|a| a.status_label() == label)
                .collect(),
            None => agents,
        })
    }

    /// Deployments of an agent, oldest first.
    pub async fn list_deployments(&self, agent_id: &AgentId) -> Result<Vec<DeploymentRecord>> {
        self.inner.store.get_agent(agent_id).await?;
        Ok(self.inner.store.list_deployments(agent_id).await?)
    }

    pub async fn status(&self, deployment_id: &DeploymentId) -> Result<StatusSnapshot> {
        let deployment = self.inner.store.get_deployment(deployment_id).await?;
        let agent = self.inner.store.get_agent(&deployment.agent_id).await?;
        let last_seq = self.inner.bus.last_seq(deployment_id).await?;
        Ok(StatusSnapshot {
            active: agent.active_deployment.as_ref() == Some(deployment_id),
            deployment,
            last_seq,
        })
    }

    /// Ordered events with `seq >= from_seq`.
    pub async fn history(
        &self,
        deployment_id: &DeploymentId,
        from_seq: u64,
    ) -> Result<Vec<EventRecord>> {
        self.inner.store.get_deployment(deployment_id).await?;
        Ok(self.inner.bus.history(deployment_id, from_seq).await?)
    }

    /// Replay from `from_seq`, then follow live events.
    pub async fn stream_events(
        &self,
        deployment_id: &DeploymentId,
        from_seq: u64,
    ) -> Result<EventStream> {
        self.inner.store.get_deployment(deployment_id).await?;
        Ok(self.inner.bus.subscribe(deployment_id, from_seq))
    }

    // -- shared helpers ----------------------------------------------------

    fn lane(&self, agent_id: &AgentId) -> Arc<Mutex<()>> {
        self.inner.lanes.entry(agent_id.clone()).or_default().clone()
    }

    fn rollout_token(&self, agent_id: &AgentId) -> Option<CancellationToken> {
        self.inner.rollouts.get(agent_id).map(|r| r.cancel.clone())
    }

    /// Free the rollout slot if it still belongs to `deployment_id`.
    fn release_slot(&self, agent_id: &AgentId, deployment_id: &DeploymentId) {
        self.inner
            .rollouts
            .remove_if(agent_id, |_, r| &r.deployment_id == deployment_id);
    }

    async fn emit(
        &self,
        deployment_id: &DeploymentId,
        event: DeploymentEvent,
    ) -> Result<EventRecord> {
        Ok(self.inner.bus.append(deployment_id, &event).await?)
    }

    /// Apply a trigger and persist the record, without an event.
    async fn set_status(
        &self,
        record: &mut DeploymentRecord,
        trigger: Trigger,
        reason: Option<String>,
    ) -> Result<(DeploymentStatus, DeploymentStatus)> {
        let from = record.status;
        let to = transition(from, trigger)?;
        record.status = to;
        record.updated_at = Utc::now();
        if to.is_terminal() && reason.is_some() {
            record.failure_reason = reason;
        }
        self.inner.store.update_deployment(record).await?;
        obs::emit_status_changed(record.deployment_id.as_str(), from.as_str(), to.as_str());
        Ok((from, to))
    }

    /// Apply a trigger, persist, and record a `status_changed` event.
    async fn advance(
        &self,
        record: &mut DeploymentRecord,
        trigger: Trigger,
        reason: Option<String>,
    ) -> Result<DeploymentStatus> {
        let (from, to) = self.set_status(record, trigger, reason.clone()).await?;
        self.emit(
            &record.deployment_id,
            DeploymentEvent::StatusChanged { from, to, reason },
        )
        .await?;
        Ok(to)
    }

    /// Release backend resources of a deployment, once, within the teardown
    /// budget. Failures are recorded as events and never retried here.
    async fn teardown(&self, record: &mut DeploymentRecord) -> Result<()> {
        let Some(handle) = record.backend_handle.clone() else {
            return Ok(());
        };
        let handle = BackendHandle(handle);
        let outcome = tokio::time::timeout(
            self.inner.config.teardown_timeout(),
            self.inner.backend.terminate(&handle),
        )
        .await;
        let error = match outcome {
            Ok(Ok(())) => {
                record.backend_handle = None;
                return Ok(());
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!(
                "terminate timed out after {}ms",
                self.inner.config.teardown_timeout_ms
            ),
        };
        obs::emit_teardown_failed(record.deployment_id.as_str(), &error);
        self.emit(
            &record.deployment_id,
            DeploymentEvent::TeardownFailed { reason: error },
        )
        .await?;
        Ok(())
    }

    async fn liveness(&self, handle: &BackendHandle) -> Liveness {
        let checked = tokio::time::timeout(
            self.inner.config.health_timeout(),
            self.inner.backend.health_check(handle),
        )
        .await;
        match checked {
            Ok(Ok(report)) if report.is_running() => Liveness::Healthy(report.usage),
            Ok(Ok(report)) => Liveness::Down(report.describe()),
            Ok(Err(BackendError::UnknownHandle(h))) => {
                Liveness::Down(format!("runtime handle {h} lost"))
            }
            Ok(Err(e)) => Liveness::Unknown(e.to_string()),
            Err(_) => Liveness::Unknown(format!(
                "health check timed out after {}ms",
                self.inner.config.health_timeout_ms
            )),
        }
    }

    /// Clear the agent's active pointer if it points at `deployment_id`.
    async fn clear_active(&self, agent_id: &AgentId, deployment_id: &DeploymentId) -> Result<()> {
        let mut agent = self.inner.store.get_agent(agent_id).await?;
        if agent.active_deployment.as_ref() == Some(deployment_id) {
            agent.active_deployment = None;
            agent.updated_at = Utc::now();
            self.inner.store.put_agent(&agent).await?;
        }
        Ok(())
    }

    async fn check_report(&self, handle: &BackendHandle) -> Result<HealthReport> {
        self.inner
            .backend
            .health_check(handle)
            .await
            .map_err(ControllerError::from)
    }
}

fn log_pipeline_error(deployment_id: &DeploymentId, err: &ControllerError) {
    warn!(deployment_id = %deployment_id, error = %err, "deployment pipeline aborted");
}
