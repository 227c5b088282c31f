//! Rollout pipeline: admit, build, launch, probation, promote.
//!
//! The predecessor keeps serving untouched until the new deployment has
//! stayed healthy for the promotion window. Only then is it retired.

use std::collections::BTreeMap;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use agentship_build::BuildError;
use agentship_state::{
    AgentId, AgentRecord, ContentDigest, DeploymentId, DeploymentRecord, DeploymentStatus,
    DesiredSpec, OwnerId, ResourceLimits, StorageError,
};

use super::{log_pipeline_error, Controller, Liveness, Rollout};
use crate::domain::{ControllerError, DeploymentEvent, Result, Trigger};
use crate::metrics::METRICS;
use crate::obs;
use crate::runtime::{BackendHandle, LaunchRequest};

/// Inbound deployment request. The owner id is trusted as pre-validated.
#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentRequest {
    pub agent_id: AgentId,
    pub owner_id: OwnerId,
    /// Name used when the agent does not exist yet
    pub agent_name: Option<String>,
    /// Digest of the source snapshot in the CAS
    pub source: ContentDigest,
    pub framework_hint: String,
    pub limits: ResourceLimits,
    pub env: BTreeMap<String, String>,
}

impl DeploymentRequest {
    pub fn new(
        agent_id: AgentId,
        owner_id: OwnerId,
        source: ContentDigest,
        framework_hint: impl Into<String>,
    ) -> Self {
        Self {
            agent_id,
            owner_id,
            agent_name: None,
            source,
            framework_hint: framework_hint.into(),
            limits: ResourceLimits::default(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.agent_name = Some(name.into());
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    fn desired(&self) -> DesiredSpec {
        DesiredSpec {
            source: self.source.clone(),
            framework_hint: self.framework_hint.clone(),
            limits: ResourceLimits {
                replicas: self.limits.replicas.max(1),
                ..self.limits
            },
            env: self.env.clone(),
        }
    }
}

enum Step {
    Continue,
    /// The pipeline is done with this deployment
    Stop,
}

impl Controller {
    /// Admit a new deployment and start its rollout in the background.
    ///
    /// Returns as soon as the deployment is recorded as `Pending`. A second
    /// request for the same agent while a rollout is in flight fails with
    /// `Conflict`; it is never queued.
    pub async fn request_deployment(&self, request: DeploymentRequest) -> Result<DeploymentId> {
        METRICS.inc_deployments_requested();
        let agent_id = request.agent_id.clone();
        let deployment_id = DeploymentId::new();
        let cancel = CancellationToken::new();

        match self.inner.rollouts.entry(agent_id.clone()) {
            Entry::Occupied(slot) => {
                METRICS.inc_conflicts();
                let in_flight = slot.get().deployment_id.to_string();
                info!(agent_id = %agent_id, in_flight = %in_flight, "deployment request conflicts");
                return Err(ControllerError::Conflict {
                    agent_id: agent_id.to_string(),
                    in_flight,
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(Rollout {
                    deployment_id: deployment_id.clone(),
                    cancel: cancel.clone(),
                });
            }
        }

        let record = match self.admit(&request, &deployment_id).await {
            Ok(record) => record,
            Err(e) => {
                self.release_slot(&agent_id, &deployment_id);
                return Err(e);
            }
        };

        let this = self.clone();
        let span = obs::deployment_span(deployment_id.as_str(), agent_id.as_str());
        tokio::spawn(
            async move {
                let id = record.deployment_id.clone();
                let agent_id = record.agent_id.clone();
                if let Err(e) = this.run_rollout(record, &cancel).await {
                    log_pipeline_error(&id, &e);
                    if let Err(cleanup) = this.abort_rollout(&id, &e).await {
                        warn!(
                            deployment_id = %id,
                            error = %cleanup,
                            "aborted deployment is not terminal, rollout slot stays held"
                        );
                        return;
                    }
                }
                this.release_slot(&agent_id, &id);
            }
            .instrument(span),
        );
        Ok(deployment_id)
    }

    /// Fail a deployment whose pipeline stopped on an error, releasing its
    /// backend resources. Succeeds once the record is terminal or serving.
    async fn abort_rollout(
        &self,
        deployment_id: &DeploymentId,
        err: &ControllerError,
    ) -> Result<()> {
        let record = self.inner.store.get_deployment(deployment_id).await?;
        let lane = self.lane(&record.agent_id);
        let _lane = lane.lock().await;

        let mut record = self.inner.store.get_deployment(deployment_id).await?;
        if record.status.is_terminal() || record.promoted {
            return Ok(());
        }
        if let Err(e) = self.teardown(&mut record).await {
            warn!(deployment_id = %deployment_id, error = %e, "teardown of aborted deployment failed");
        }
        let reason = format!("pipeline aborted: {err}");
        let (from, to) = self
            .set_status(&mut record, Trigger::Interrupted, Some(reason.clone()))
            .await?;
        let changed = DeploymentEvent::StatusChanged {
            from,
            to,
            reason: Some(reason),
        };
        if let Err(e) = self.emit(deployment_id, changed).await {
            warn!(deployment_id = %deployment_id, error = %e, "could not record aborted deployment");
        }
        Ok(())
    }

    /// Roll out the agent's current source and framework with new limits.
    pub async fn scale(&self, agent_id: &AgentId, limits: ResourceLimits) -> Result<DeploymentId> {
        let agent = self.inner.store.get_agent(agent_id).await?;
        let (source, framework_hint, env) = match &agent.active_deployment {
            Some(active) => {
                let d = self.inner.store.get_deployment(active).await?;
                (d.source, d.framework_hint, d.env)
            }
            None => match agent.desired {
                Some(desired) => (desired.source, desired.framework_hint, desired.env),
                None => {
                    return Err(ControllerError::NotFound {
                        what: format!("deployable spec for agent {agent_id}"),
                    })
                }
            },
        };
        let request = DeploymentRequest::new(agent_id.clone(), agent.owner_id, source, framework_hint)
            .with_limits(limits)
            .with_env(env);
        self.request_deployment(request).await
    }

    async fn admit(
        &self,
        request: &DeploymentRequest,
        deployment_id: &DeploymentId,
    ) -> Result<DeploymentRecord> {
        let lane = self.lane(&request.agent_id);
        let _lane = lane.lock().await;
        let store = &self.inner.store;

        let mut agent = match store.get_agent(&request.agent_id).await {
            Ok(agent) if agent.owner_id != request.owner_id => {
                return Err(ControllerError::NotFound {
                    what: format!("agent {}", request.agent_id),
                })
            }
            Ok(agent) if agent.is_terminated() => {
                return Err(ControllerError::AgentTerminated {
                    agent_id: request.agent_id.to_string(),
                })
            }
            Ok(agent) => agent,
            Err(StorageError::AgentNotFound { .. }) => AgentRecord::new(
                request.agent_id.clone(),
                request.owner_id.clone(),
                request
                    .agent_name
                    .clone()
                    .unwrap_or_else(|| request.agent_id.to_string()),
                None,
            ),
            Err(e) => return Err(e.into()),
        };

        let predecessor = match &agent.active_deployment {
            Some(active) => {
                let d = store.get_deployment(active).await?;
                (d.status == DeploymentStatus::Running).then_some(d.deployment_id)
            }
            None => None,
        };

        let desired = request.desired();
        let mut record = DeploymentRecord::new(agent.agent_id.clone(), &desired, predecessor);
        record.deployment_id = deployment_id.clone();
        store.insert_deployment(&record).await?;

        agent.desired = Some(desired);
        agent.updated_at = Utc::now();
        store.put_agent(&agent).await?;

        self.emit(
            deployment_id,
            DeploymentEvent::Requested {
                agent_id: record.agent_id.clone(),
                source: record.source.clone(),
                framework_hint: record.framework_hint.clone(),
                predecessor: record.predecessor.clone(),
            },
        )
        .await?;
        obs::emit_deployment_requested(
            deployment_id.as_str(),
            record.agent_id.as_str(),
            &record.framework_hint,
        );
        Ok(record)
    }

    async fn run_rollout(&self, record: DeploymentRecord, cancel: &CancellationToken) -> Result<()> {
        let lane = self.lane(&record.agent_id);
        let _lane = lane.lock().await;

        // Cancel or terminate may have run between admission and now.
        let mut record = self.inner.store.get_deployment(&record.deployment_id).await?;
        if record.status != DeploymentStatus::Pending || cancel.is_cancelled() {
            debug!(status = %record.status, "rollout not started");
            return Ok(());
        }

        if let Step::Stop = self.build(&mut record, cancel).await? {
            return Ok(());
        }
        let handle = match self.launch(&mut record, cancel).await? {
            Some(handle) => handle,
            None => return Ok(()),
        };
        if let Step::Stop = self.probation(&mut record, &handle, cancel).await? {
            return Ok(());
        }
        self.promote(&mut record).await
    }

    async fn build(&self, record: &mut DeploymentRecord, cancel: &CancellationToken) -> Result<Step> {
        let id = record.deployment_id.clone();
        self.advance(record, Trigger::StartBuild, None).await?;
        self.emit(&id, DeploymentEvent::BuildStarted).await?;

        let outcome = self
            .inner
            .builder
            .build(&record.source, &record.framework_hint, cancel)
            .await;
        let outcome = match outcome {
            Ok(outcome) => outcome,
            // The canceller finishes the transition once it holds the lane.
            Err(BuildError::Cancelled) => return Ok(Step::Stop),
            Err(err) => {
                METRICS.inc_build_failures();
                warn!(error_kind = err.kind(), error = %err, "build failed");
                record.build_log = err.log_ref().cloned();
                self.emit(
                    &id,
                    DeploymentEvent::BuildFailed {
                        error_kind: err.kind().to_string(),
                        reason: err.to_string(),
                        log_ref: err.log_ref().cloned(),
                    },
                )
                .await?;
                let reason = format!("{}: {err}", err.kind());
                self.advance(record, Trigger::BuildFailed, Some(reason)).await?;
                return Ok(Step::Stop);
            }
        };

        let artifact = outcome.artifact.hash.clone();
        record.artifact = Some(artifact.clone());
        record.build_log = Some(outcome.artifact.build_log.clone());
        self.emit(
            &id,
            DeploymentEvent::BuildSucceeded {
                artifact,
                cached: outcome.cached,
            },
        )
        .await?;
        self.advance(record, Trigger::BuildSucceeded, None).await?;
        Ok(Step::Continue)
    }

    async fn launch(
        &self,
        record: &mut DeploymentRecord,
        cancel: &CancellationToken,
    ) -> Result<Option<BackendHandle>> {
        let id = record.deployment_id.clone();
        let Some(artifact) = record.artifact.clone() else {
            self.fail_launch(record, "no artifact recorded".into()).await?;
            return Ok(None);
        };
        self.emit(
            &id,
            DeploymentEvent::LaunchStarted {
                artifact: artifact.clone(),
            },
        )
        .await?;

        let request = LaunchRequest {
            deployment_id: id.clone(),
            artifact,
            limits: record.limits,
            env: record.env.clone(),
        };
        let config = &self.inner.config;
        let launched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            res = tokio::time::timeout(config.launch_timeout(), self.inner.backend.launch(&request)) => res,
        };
        let handle = match launched {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                self.fail_launch(record, e.to_string()).await?;
                return Ok(None);
            }
            Err(_) => {
                let reason = format!("launch timed out after {}ms", config.launch_timeout_ms);
                self.fail_launch(record, reason).await?;
                return Ok(None);
            }
        };

        // Persist the handle first so a restart can find the resources.
        record.backend_handle = Some(handle.0.clone());
        record.updated_at = Utc::now();
        self.inner.store.update_deployment(record).await?;
        info!(handle = %handle, backend = self.inner.backend.name(), "launched");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            _ = tokio::time::sleep(config.launch_grace()) => {}
        }

        match self.liveness(&handle).await {
            Liveness::Healthy(usage) => {
                self.advance(record, Trigger::LaunchReady, None).await?;
                self.emit(&id, DeploymentEvent::Healthy { usage }).await?;
                Ok(Some(handle))
            }
            Liveness::Down(reason) | Liveness::Unknown(reason) => {
                self.fail_launch(record, reason).await?;
                Ok(None)
            }
        }
    }

    async fn fail_launch(&self, record: &mut DeploymentRecord, reason: String) -> Result<()> {
        warn!(reason = %reason, "launch failed");
        self.emit(
            &record.deployment_id,
            DeploymentEvent::LaunchFailed {
                reason: reason.clone(),
            },
        )
        .await?;
        self.teardown(record).await?;
        self.advance(record, Trigger::LaunchFailed, Some(format!("LaunchError: {reason}")))
            .await?;
        Ok(())
    }

    /// Watch the new deployment until the promotion window has passed.
    async fn probation(
        &self,
        record: &mut DeploymentRecord,
        handle: &BackendHandle,
        cancel: &CancellationToken,
    ) -> Result<Step> {
        let config = &self.inner.config;
        let deadline = Instant::now() + config.promotion_window();
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(Step::Continue);
            }
            let wait = config.health_interval().min(deadline - now);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(Step::Stop),
                _ = tokio::time::sleep(wait) => {}
            }
            match self.liveness(handle).await {
                Liveness::Healthy(_) => {}
                Liveness::Down(reason) => {
                    self.handle_crash(record, reason).await?;
                    return Ok(Step::Stop);
                }
                Liveness::Unknown(reason) => {
                    debug!(reason = %reason, "health unknown during probation");
                }
            }
        }
    }

    /// Retire whatever served the agent before and make this deployment active.
    async fn promote(&self, record: &mut DeploymentRecord) -> Result<()> {
        let store = &self.inner.store;
        let id = record.deployment_id.clone();
        let mut agent = store.get_agent(&record.agent_id).await?;

        let mut candidates: Vec<DeploymentId> = Vec::new();
        for previous in [record.predecessor.clone(), agent.active_deployment.clone()]
            .into_iter()
            .flatten()
        {
            if previous != id && !candidates.contains(&previous) {
                candidates.push(previous);
            }
        }

        let mut retired = None;
        for previous in candidates {
            let mut old = store.get_deployment(&previous).await?;
            if old.status != DeploymentStatus::Running {
                continue;
            }
            self.teardown(&mut old).await?;
            self.emit(&previous, DeploymentEvent::Superseded { by: id.clone() })
                .await?;
            self.advance(&mut old, Trigger::Retire, Some(format!("superseded by {id}")))
                .await?;
            retired = Some(previous);
        }

        record.promoted = true;
        record.updated_at = Utc::now();
        store.update_deployment(record).await?;

        agent.active_deployment = Some(id.clone());
        agent.updated_at = Utc::now();
        store.put_agent(&agent).await?;

        self.emit(
            &id,
            DeploymentEvent::Promoted {
                retired: retired.clone(),
            },
        )
        .await?;
        METRICS.inc_promotions();
        obs::emit_promoted(id.as_str(), retired.as_ref().map(|r| r.as_str()));
        Ok(())
    }
}
