//! Cancelling deployments and terminating agents.

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use agentship_state::{AgentId, AgentRecord, DeploymentId, DeploymentStatus};

use super::Controller;
use crate::domain::{DeploymentEvent, Result, Trigger};

/// Result of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The deployment is now `Terminated`
    Cancelled,
    /// It had already reached this terminal status; nothing changed
    AlreadyFinal(DeploymentStatus),
}

impl Controller {
    /// Stop a deployment in any non-terminal status.
    ///
    /// `Pending` and `Building` stop without touching the backend. Launched
    /// resources are torn down first; a failed teardown is recorded and the
    /// deployment still ends `Terminated`. Cancelling a deployment that has
    /// already finished succeeds with `AlreadyFinal`.
    pub async fn cancel_deployment(&self, deployment_id: &DeploymentId) -> Result<CancelOutcome> {
        let record = self.inner.store.get_deployment(deployment_id).await?;
        if record.status.is_terminal() {
            return Ok(CancelOutcome::AlreadyFinal(record.status));
        }

        // Interrupt the pipeline so it gives up the lane.
        if let Some(token) = self.slot_token(&record.agent_id, deployment_id) {
            token.cancel();
        }

        let lane = self.lane(&record.agent_id);
        let _lane = lane.lock().await;

        let mut record = self.inner.store.get_deployment(deployment_id).await?;
        if record.status.is_terminal() {
            return Ok(CancelOutcome::AlreadyFinal(record.status));
        }

        self.emit(deployment_id, DeploymentEvent::CancelRequested).await?;
        self.teardown(&mut record).await?;
        self.advance(&mut record, Trigger::Cancel, Some("cancelled by request".into()))
            .await?;
        self.clear_active(&record.agent_id, deployment_id).await?;
        self.release_slot(&record.agent_id, deployment_id);
        info!(deployment_id = %deployment_id, "deployment cancelled");
        Ok(CancelOutcome::Cancelled)
    }

    /// Tear down everything an agent runs and mark it terminated.
    ///
    /// Idempotent. A terminated agent rejects new deployments.
    pub async fn terminate_agent(&self, agent_id: &AgentId) -> Result<AgentRecord> {
        let agent = self.inner.store.get_agent(agent_id).await?;
        if agent.is_terminated() {
            return Ok(agent);
        }
        if let Some(token) = self.rollout_token(agent_id) {
            token.cancel();
        }

        let lane = self.lane(agent_id);
        let _lane = lane.lock().await;

        for mut deployment in self.inner.store.list_deployments(agent_id).await? {
            if deployment.status.is_terminal() {
                continue;
            }
            self.teardown(&mut deployment).await?;
            self.advance(&mut deployment, Trigger::Cancel, Some("agent terminated".into()))
                .await?;
            self.release_slot(agent_id, &deployment.deployment_id);
        }

        let mut agent = self.inner.store.get_agent(agent_id).await?;
        let now = Utc::now();
        agent.active_deployment = None;
        agent.terminated_at = Some(now);
        agent.updated_at = now;
        self.inner.store.put_agent(&agent).await?;
        info!(agent_id = %agent_id, "agent terminated");
        Ok(agent)
    }

    /// Cancel token of the rollout slot, if `deployment_id` holds it.
    fn slot_token(&self, agent_id: &AgentId, deployment_id: &DeploymentId) -> Option<CancellationToken> {
        self.inner
            .rollouts
            .get(agent_id)
            .filter(|r| &r.deployment_id == deployment_id)
            .map(|r| r.cancel.clone())
    }
}
