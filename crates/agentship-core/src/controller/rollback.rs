//! Crash handling for running deployments.

use chrono::Utc;
use tracing::info;

use agentship_state::{DeploymentId, DeploymentRecord, DeploymentStatus};

use super::{Controller, Liveness};
use crate::domain::{DeploymentEvent, Result, Trigger};
use crate::metrics::METRICS;
use crate::obs;
use crate::runtime::BackendHandle;

impl Controller {
    /// React to a crash of a `Running` deployment. Caller holds the lane.
    ///
    /// An unpromoted deployment whose predecessor is still alive rolls back
    /// to it; the predecessor itself is left alone. Anything else fails with
    /// a surfaced runtime crash and leaves the agent without an active
    /// deployment.
    pub(super) async fn handle_crash(
        &self,
        record: &mut DeploymentRecord,
        reason: String,
    ) -> Result<()> {
        self.record_crash(record, &reason).await?;

        let Some(restored) = self.fallback_for(record).await? else {
            return self.surface_crash(record, &reason).await;
        };
        let id = record.deployment_id.clone();
        let detail = format!("RuntimeCrash: {reason}; rolled back to {restored}");
        self.set_status(record, Trigger::Crashed { fallback: true }, Some(detail))
            .await?;
        self.emit(
            &id,
            DeploymentEvent::RolledBack {
                restored: restored.clone(),
            },
        )
        .await?;

        let mut agent = self.inner.store.get_agent(&record.agent_id).await?;
        if agent.active_deployment.as_ref() != Some(&restored) {
            agent.active_deployment = Some(restored.clone());
            agent.updated_at = Utc::now();
            self.inner.store.put_agent(&agent).await?;
        }
        METRICS.inc_rollbacks();
        obs::emit_rollback(id.as_str(), restored.as_str(), &reason);
        Ok(())
    }

    async fn record_crash(&self, record: &mut DeploymentRecord, reason: &str) -> Result<()> {
        self.emit(
            &record.deployment_id,
            DeploymentEvent::CrashDetected {
                reason: reason.to_string(),
            },
        )
        .await?;
        self.teardown(record).await
    }

    /// Fail a crashed deployment that has nothing to fall back to.
    async fn surface_crash(&self, record: &mut DeploymentRecord, reason: &str) -> Result<()> {
        let id = record.deployment_id.clone();
        self.set_status(
            record,
            Trigger::Crashed { fallback: false },
            Some(format!("RuntimeCrash: {reason}")),
        )
        .await?;
        self.emit(
            &id,
            DeploymentEvent::RuntimeCrashSurfaced {
                reason: reason.to_string(),
            },
        )
        .await?;
        self.clear_active(&record.agent_id, &id).await?;
        obs::emit_runtime_crash_surfaced(id.as_str(), record.agent_id.as_str(), reason);
        Ok(())
    }

    /// Most recent healthy deployment to fall back to, if any.
    ///
    /// The predecessor is checked against the backend first. One that died
    /// unnoticed is failed here, since it is promoted and has no fallback of
    /// its own.
    async fn fallback_for(&self, record: &DeploymentRecord) -> Result<Option<DeploymentId>> {
        if record.promoted {
            return Ok(None);
        }
        let Some(predecessor) = &record.predecessor else {
            return Ok(None);
        };
        let mut previous = self.inner.store.get_deployment(predecessor).await?;
        if previous.status != DeploymentStatus::Running {
            info!(
                predecessor = %predecessor,
                status = %previous.status,
                "predecessor no longer running, no rollback target"
            );
            return Ok(None);
        }
        let Some(handle) = previous.backend_handle.clone().map(BackendHandle) else {
            return Ok(None);
        };
        match self.liveness(&handle).await {
            Liveness::Down(reason) => {
                info!(predecessor = %predecessor, reason = %reason, "predecessor is down too");
                self.record_crash(&mut previous, &reason).await?;
                self.surface_crash(&mut previous, &reason).await?;
                Ok(None)
            }
            Liveness::Healthy(_) | Liveness::Unknown(_) => Ok(Some(previous.deployment_id)),
        }
    }
}
