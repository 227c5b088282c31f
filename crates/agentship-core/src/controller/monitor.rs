//! Health observation of promoted deployments.
//!
//! Deployments still in probation are watched by their own rollout; this
//! covers everything that already serves an agent.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use agentship_state::{DeploymentId, DeploymentStatus};

use super::{Controller, Liveness};
use crate::domain::{ControllerError, DeploymentEvent, Result};
use crate::metrics::METRICS;
use crate::runtime::{BackendHandle, HealthReport, ResourceUsage};

/// What one monitoring pass found.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MonitorReport {
    pub checked: usize,
    /// Deployments found down and handed to crash handling
    pub crashed: Vec<DeploymentId>,
    /// Deployments whose health could not be determined
    pub unknown: Vec<DeploymentId>,
    /// Down, but their agent's lane was busy; retried on the next pass
    pub deferred: Vec<DeploymentId>,
}

enum CrashOutcome {
    Handled,
    Deferred,
    Stale,
}

impl Controller {
    /// Ask the backend about one deployment.
    pub async fn check_health(&self, deployment_id: &DeploymentId) -> Result<HealthReport> {
        let record = self.inner.store.get_deployment(deployment_id).await?;
        let handle = record.backend_handle.ok_or_else(|| ControllerError::NotFound {
            what: format!("runtime handle of {deployment_id}"),
        })?;
        self.check_report(&BackendHandle(handle)).await
    }

    /// Check every promoted `Running` deployment once.
    pub async fn monitor_once(&self) -> Result<MonitorReport> {
        let mut report = MonitorReport::default();
        let live = self.inner.store.list_live_deployments().await?;

        for record in live
            .into_iter()
            .filter(|d| d.status == DeploymentStatus::Running && d.promoted)
        {
            let Some(handle) = record.backend_handle.clone().map(BackendHandle) else {
                continue;
            };
            report.checked += 1;
            match self.liveness(&handle).await {
                Liveness::Healthy(usage) => {
                    if usage != ResourceUsage::default() {
                        self.emit(&record.deployment_id, DeploymentEvent::ResourceUsage { usage })
                            .await?;
                    }
                }
                Liveness::Down(reason) => {
                    match self.crashed(&record.deployment_id, &handle, reason).await? {
                        CrashOutcome::Handled => report.crashed.push(record.deployment_id.clone()),
                        CrashOutcome::Deferred => {
                            debug!(deployment_id = %record.deployment_id, "lane busy, crash handling deferred");
                            report.deferred.push(record.deployment_id.clone());
                        }
                        CrashOutcome::Stale => {}
                    }
                }
                Liveness::Unknown(reason) => {
                    warn!(deployment_id = %record.deployment_id, reason = %reason, "health unknown");
                    report.unknown.push(record.deployment_id.clone());
                }
            }
        }
        Ok(report)
    }

    /// Run `monitor_once` every `monitor_interval` until cancelled.
    pub fn spawn_monitor(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.inner.config.monitor_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match this.monitor_once().await {
                            Ok(report) => debug!(checked = report.checked, crashed = report.crashed.len(), "monitor pass"),
                            Err(e) => warn!(error = %e, "monitor pass failed"),
                        }
                    }
                }
            }
            METRICS.flush();
        })
    }

    /// Crash handling under the lane, if nothing changed since the check.
    ///
    /// Never waits for the lane: a rollout holds it through probation.
    async fn crashed(
        &self,
        deployment_id: &DeploymentId,
        handle: &BackendHandle,
        reason: String,
    ) -> Result<CrashOutcome> {
        let record = self.inner.store.get_deployment(deployment_id).await?;
        let lane = self.lane(&record.agent_id);
        let Ok(_lane) = lane.try_lock() else {
            return Ok(CrashOutcome::Deferred);
        };

        let mut record = self.inner.store.get_deployment(deployment_id).await?;
        let unchanged = record.status == DeploymentStatus::Running
            && record.backend_handle.as_deref() == Some(handle.as_str());
        if !unchanged {
            return Ok(CrashOutcome::Stale);
        }
        self.handle_crash(&mut record, reason).await?;
        Ok(CrashOutcome::Handled)
    }
}
