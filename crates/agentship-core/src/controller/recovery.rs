//! Reconciliation of persisted state with the backend after a restart.
//!
//! Rules:
//! - `Pending`/`Building`: the work is gone, fail it
//! - `Launching`: tear down whatever was started, fail it
//! - `Running` without a live backend handle: fail it (never report a phantom Running)
//! - surviving `Running`: the newest per agent serves it, older ones are retired
//! - backend handles no record refers to are terminated

use std::collections::{BTreeMap, HashSet};

use chrono::Utc;
use tracing::{info, warn};

use agentship_state::{AgentId, DeploymentId, DeploymentRecord, DeploymentStatus};

use super::Controller;
use crate::domain::{DeploymentEvent, Result, Trigger};
use crate::obs;
use crate::runtime::BackendHandle;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    /// Failed because their build or launch was interrupted
    pub interrupted: Vec<DeploymentId>,
    /// Failed because the backend no longer runs them
    pub lost: Vec<DeploymentId>,
    /// Surviving deployments that serve their agent again
    pub adopted: Vec<DeploymentId>,
    /// Older survivors replaced by a newer one
    pub retired: Vec<DeploymentId>,
    pub orphans_terminated: Vec<BackendHandle>,
}

impl Controller {
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let store = &self.inner.store;
        let mut report = ReconcileReport::default();

        let running: HashSet<BackendHandle> =
            self.inner.backend.running().await?.into_iter().collect();
        let mut referenced: HashSet<BackendHandle> = HashSet::new();

        let mut by_agent: BTreeMap<AgentId, Vec<DeploymentRecord>> = BTreeMap::new();
        for record in store.list_live_deployments().await? {
            if let Some(handle) = &record.backend_handle {
                referenced.insert(BackendHandle(handle.clone()));
            }
            by_agent.entry(record.agent_id.clone()).or_default().push(record);
        }

        for (agent_id, mut deployments) in by_agent {
            deployments.sort_by_key(|d| d.created_at);
            let lane = self.lane(&agent_id);
            let _lane = lane.lock().await;

            let mut survivors = Vec::new();
            for mut record in deployments {
                match record.status {
                    DeploymentStatus::Pending | DeploymentStatus::Building => {
                        self.interrupt(&mut record, "interrupted by controller restart")
                            .await?;
                        report.interrupted.push(record.deployment_id);
                    }
                    DeploymentStatus::Launching => {
                        self.teardown(&mut record).await?;
                        self.interrupt(&mut record, "launch interrupted by controller restart")
                            .await?;
                        report.interrupted.push(record.deployment_id);
                    }
                    DeploymentStatus::Running => {
                        let alive = record
                            .backend_handle
                            .as_ref()
                            .is_some_and(|h| running.contains(&BackendHandle(h.clone())));
                        if alive {
                            survivors.push(record);
                        } else {
                            self.interrupt(&mut record, "runtime handle lost across controller restart")
                                .await?;
                            report.lost.push(record.deployment_id);
                        }
                    }
                    _ => {}
                }
            }

            // A probation cut short does not outrank a promoted deployment.
            if survivors.iter().any(|d| d.promoted) {
                let (promoted, unpromoted): (Vec<_>, Vec<_>) =
                    survivors.into_iter().partition(|d| d.promoted);
                for mut record in unpromoted {
                    self.teardown(&mut record).await?;
                    self.interrupt(&mut record, "probation interrupted by controller restart")
                        .await?;
                    report.interrupted.push(record.deployment_id);
                }
                survivors = promoted;
            }

            // Oldest first, so the newest survivor is last.
            let Some(mut newest) = survivors.pop() else {
                continue;
            };
            for mut older in survivors {
                self.teardown(&mut older).await?;
                self.emit(
                    &older.deployment_id,
                    DeploymentEvent::Superseded {
                        by: newest.deployment_id.clone(),
                    },
                )
                .await?;
                let reason = format!("superseded by {}", newest.deployment_id);
                self.advance(&mut older, Trigger::Retire, Some(reason)).await?;
                report.retired.push(older.deployment_id);
            }

            if !newest.promoted {
                newest.promoted = true;
                newest.updated_at = Utc::now();
                store.update_deployment(&newest).await?;
            }
            self.emit(
                &newest.deployment_id,
                DeploymentEvent::Reconciled {
                    reason: "adopted after controller restart".into(),
                },
            )
            .await?;

            let mut agent = store.get_agent(&agent_id).await?;
            if agent.active_deployment.as_ref() != Some(&newest.deployment_id) {
                agent.active_deployment = Some(newest.deployment_id.clone());
                agent.updated_at = Utc::now();
                store.put_agent(&agent).await?;
            }
            report.adopted.push(newest.deployment_id);
        }

        // Active pointers may still name deployments that just failed.
        for mut agent in store.list_agents(None).await? {
            let stale = agent
                .active_deployment
                .as_ref()
                .is_some_and(|active| !report.adopted.contains(active));
            if stale {
                agent.active_deployment = None;
                agent.updated_at = Utc::now();
                store.put_agent(&agent).await?;
            }
        }

        for handle in running.difference(&referenced) {
            match self.inner.backend.terminate(handle).await {
                Ok(()) => {
                    info!(handle = %handle, "terminated orphaned backend resources");
                    report.orphans_terminated.push(handle.clone());
                }
                Err(e) => warn!(handle = %handle, error = %e, "could not terminate orphan"),
            }
        }
        report.orphans_terminated.sort();
        Ok(report)
    }

    async fn interrupt(&self, record: &mut DeploymentRecord, reason: &str) -> Result<()> {
        let from = record.status;
        self.emit(
            &record.deployment_id,
            DeploymentEvent::Reconciled {
                reason: reason.to_string(),
            },
        )
        .await?;
        let to = self
            .advance(record, Trigger::Interrupted, Some(reason.to_string()))
            .await?;
        obs::emit_reconciled(record.deployment_id.as_str(), from.as_str(), to.as_str(), reason);
        Ok(())
    }
}
