//! End-to-end controller behaviour over in-memory stores and backend.

use std::sync::Arc;
use std::time::Duration;

use agentship_build::{
    BuildConfig, BuildEngine, BuildError, PackageFailure, PackageOutput, PackageRequest, Packager,
    SourceSnapshot,
};
use agentship_core::{
    CancelOutcome, Controller, ControllerConfig, ControllerError, DeploymentEvent,
    DeploymentRequest, MemoryBackend,
};
use agentship_state::fakes::{
    MemoryArtifactCatalog, MemoryCasStore, MemoryDeploymentStore, MemoryEventLog,
};
use agentship_state::{
    AgentId, ArtifactCatalog, ContentDigest, DeploymentId, DeploymentRecord, DeploymentStatus,
    OwnerId, ResourceLimits,
};
use async_trait::async_trait;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Harness {
    controller: Controller,
    backend: Arc<MemoryBackend>,
    builder: BuildEngine,
}

fn config() -> ControllerConfig {
    ControllerConfig::default()
        .with_launch_grace_ms(100)
        .with_promotion_window_ms(10_000)
        .with_health_interval_ms(500)
}

fn harness_with(builder: impl FnOnce(BuildEngine) -> BuildEngine) -> Harness {
    let cas = Arc::new(MemoryCasStore::new());
    let builder = builder(BuildEngine::new(cas, Arc::new(MemoryArtifactCatalog::new())));
    let backend = Arc::new(MemoryBackend::new());
    let controller = Controller::new(
        Arc::new(MemoryDeploymentStore::new()),
        Arc::new(MemoryEventLog::new()),
        builder.clone(),
        backend.clone(),
        config(),
    );
    Harness {
        controller,
        backend,
        builder,
    }
}

fn harness() -> Harness {
    harness_with(|b| b)
}

fn owner() -> OwnerId {
    OwnerId("user-1".into())
}

impl Harness {
    async fn source(&self, marker: &str) -> ContentDigest {
        let snapshot = SourceSnapshot::new()
            .with_file("main.py", format!("print('{marker}')"))
            .unwrap()
            .with_file("requirements.txt", "langgraph\n")
            .unwrap();
        self.builder.submit_snapshot(&snapshot).await.unwrap()
    }

    async fn deploy(&self, agent: &AgentId, marker: &str) -> DeploymentId {
        let source = self.source(marker).await;
        self.controller
            .request_deployment(DeploymentRequest::new(agent.clone(), owner(), source, "langgraph"))
            .await
            .unwrap()
    }

    async fn record(&self, id: &DeploymentId) -> DeploymentRecord {
        self.controller.status(id).await.unwrap().deployment
    }

    /// Poll until `done` holds; time is paused, so sleeps are free.
    async fn wait_until(
        &self,
        id: &DeploymentId,
        done: impl Fn(&DeploymentRecord) -> bool,
    ) -> DeploymentRecord {
        for _ in 0..2_000 {
            let record = self.record(id).await;
            if done(&record) {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("deployment {id} never reached the expected state");
    }

    async fn wait_promoted(&self, id: &DeploymentId) -> DeploymentRecord {
        self.wait_until(id, |d| d.status == DeploymentStatus::Running && d.promoted)
            .await
    }

    async fn wait_running(&self, id: &DeploymentId) -> DeploymentRecord {
        self.wait_until(id, |d| d.status == DeploymentStatus::Running)
            .await
    }

    async fn wait_terminal(&self, id: &DeploymentId) -> DeploymentRecord {
        self.wait_until(id, |d| d.status.is_terminal()).await
    }

    async fn kinds(&self, id: &DeploymentId) -> Vec<String> {
        self.controller
            .history(id, 1)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect()
    }
}

/// Never finishes.
struct HangingPackager;

#[async_trait]
impl Packager for HangingPackager {
    fn fingerprint(&self) -> String {
        "hang".into()
    }

    async fn package(&self, _request: &PackageRequest) -> Result<PackageOutput, PackageFailure> {
        std::future::pending().await
    }
}

// ---------------------------------------------------------------------------
// Rollout and rollback
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn first_deployment_is_promoted_and_active() {
    let h = harness();
    let agent = AgentId::generate();
    let d1 = h.deploy(&agent, "v1").await;

    let record = h.wait_promoted(&d1).await;
    assert!(record.artifact.is_some());
    assert!(record.backend_handle.is_some());
    assert!(h.backend.is_running(&d1));
    assert!(h.controller.check_health(&d1).await.unwrap().is_running());

    let status = h.controller.status(&d1).await.unwrap();
    assert!(status.active);
    assert_eq!(
        h.controller.get_agent(&agent).await.unwrap().active_deployment,
        Some(d1.clone())
    );
    assert_eq!(
        h.kinds(&d1).await,
        vec![
            "requested",
            "status_changed",
            "build_started",
            "build_succeeded",
            "status_changed",
            "launch_started",
            "status_changed",
            "healthy",
            "promoted",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn crash_during_probation_rolls_back_to_predecessor() {
    let h = harness();
    let agent = AgentId::generate();

    let d1 = h.deploy(&agent, "v1").await;
    h.wait_promoted(&d1).await;
    let d1_history = h.controller.history(&d1, 1).await.unwrap();

    let d2 = h.deploy(&agent, "v2").await;
    h.wait_running(&d2).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(h.backend.crash_deployment(&d2, "segfault"));

    let d2_record = h.wait_terminal(&d2).await;
    assert_eq!(d2_record.status, DeploymentStatus::RolledBack);
    assert!(!d2_record.promoted);
    assert!(!h.backend.is_running(&d2));

    let d1_status = h.controller.status(&d1).await.unwrap();
    assert_eq!(d1_status.deployment.status, DeploymentStatus::Running);
    assert!(d1_status.active);
    assert!(h.backend.is_running(&d1));
    assert_eq!(h.controller.history(&d1, 1).await.unwrap(), d1_history);

    let d2_events = h.controller.history(&d2, 1).await.unwrap();
    let tail: Vec<_> = d2_events[d2_events.len() - 2..]
        .iter()
        .map(|e| DeploymentEvent::from_record(e).unwrap())
        .collect();
    assert_eq!(
        tail,
        vec![
            DeploymentEvent::CrashDetected {
                reason: "crashed: segfault".into()
            },
            DeploymentEvent::RolledBack {
                restored: d1.clone()
            },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn promotion_retires_the_predecessor() {
    let h = harness();
    let agent = AgentId::generate();
    let d1 = h.deploy(&agent, "v1").await;
    h.wait_promoted(&d1).await;

    let d2 = h.deploy(&agent, "v2").await;
    h.wait_promoted(&d2).await;

    let d1_record = h.record(&d1).await;
    assert_eq!(d1_record.status, DeploymentStatus::Terminated);
    assert_eq!(
        d1_record.failure_reason.as_deref(),
        Some(format!("superseded by {d2}").as_str())
    );
    assert!(!h.backend.is_running(&d1));
    assert!(h.kinds(&d1).await.contains(&"superseded".to_string()));

    let last = h.controller.history(&d2, 1).await.unwrap().pop().unwrap();
    assert_eq!(
        DeploymentEvent::from_record(&last).unwrap(),
        DeploymentEvent::Promoted { retired: Some(d1) }
    );
    assert!(h.controller.status(&d2).await.unwrap().active);
}

#[tokio::test(start_paused = true)]
async fn crash_after_promotion_without_fallback_is_surfaced() {
    let h = harness();
    let agent = AgentId::generate();
    let d1 = h.deploy(&agent, "v1").await;
    h.wait_promoted(&d1).await;

    h.backend.crash_deployment(&d1, "out of memory");
    let report = h.controller.monitor_once().await.unwrap();
    assert_eq!(report.checked, 1);
    assert_eq!(report.crashed, vec![d1.clone()]);

    let record = h.record(&d1).await;
    assert_eq!(record.status, DeploymentStatus::Failed);
    assert!(record
        .failure_reason
        .as_deref()
        .unwrap()
        .starts_with("RuntimeCrash"));
    assert!(matches!(
        ControllerError::from_failed(&record),
        Some(ControllerError::RuntimeCrash { .. })
    ));
    assert_eq!(
        h.kinds(&d1).await.last().map(String::as_str),
        Some("runtime_crash_surfaced")
    );
    assert!(h.controller.get_agent(&agent).await.unwrap().active_deployment.is_none());
}

#[tokio::test(start_paused = true)]
async fn background_monitor_detects_crashes() {
    let h = harness();
    let agent = AgentId::generate();
    let d1 = h.deploy(&agent, "v1").await;
    h.wait_promoted(&d1).await;

    let stop = tokio_util::sync::CancellationToken::new();
    let monitor = h.controller.spawn_monitor(stop.clone());
    h.backend.crash_deployment(&d1, "exit 137");

    let record = h.wait_terminal(&d1).await;
    assert_eq!(record.status, DeploymentStatus::Failed);
    stop.cancel();
    monitor.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn rollback_skips_a_predecessor_that_is_down() {
    let h = harness();
    let agent = AgentId::generate();
    let d1 = h.deploy(&agent, "v1").await;
    h.wait_promoted(&d1).await;

    let d2 = h.deploy(&agent, "v2").await;
    h.wait_running(&d2).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(h.backend.crash_deployment(&d1, "out of memory"));
    assert!(h.backend.crash_deployment(&d2, "segfault"));

    let d2_record = h.wait_terminal(&d2).await;
    assert_eq!(d2_record.status, DeploymentStatus::Failed);
    assert!(d2_record
        .failure_reason
        .as_deref()
        .unwrap()
        .starts_with("RuntimeCrash"));
    assert!(!h.kinds(&d2).await.contains(&"rolled_back".to_string()));

    let d1_record = h.record(&d1).await;
    assert_eq!(d1_record.status, DeploymentStatus::Failed);
    assert!(d1_record
        .failure_reason
        .as_deref()
        .unwrap()
        .contains("out of memory"));
    assert_eq!(
        h.kinds(&d1).await.last().map(String::as_str),
        Some("runtime_crash_surfaced")
    );
    assert!(h.controller.get_agent(&agent).await.unwrap().active_deployment.is_none());
    assert!(!h.backend.is_running(&d1));
    assert!(!h.backend.is_running(&d2));
}

#[tokio::test(start_paused = true)]
async fn monitor_does_not_wait_for_agents_in_probation() {
    let h = harness();
    let a = AgentId::generate();
    let b = AgentId::generate();
    let a1 = h.deploy(&a, "a1").await;
    let b1 = h.deploy(&b, "b1").await;
    h.wait_promoted(&a1).await;
    h.wait_promoted(&b1).await;

    // a2's rollout holds agent a's lane for the whole promotion window.
    let a2 = h.deploy(&a, "a2").await;
    h.wait_running(&a2).await;
    h.backend.crash_deployment(&a1, "exit 1");
    h.backend.crash_deployment(&b1, "exit 1");

    let started = tokio::time::Instant::now();
    let report = h.controller.monitor_once().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(report.checked, 2);
    assert_eq!(report.crashed, vec![b1.clone()]);
    assert_eq!(report.deferred, vec![a1.clone()]);

    assert_eq!(h.record(&b1).await.status, DeploymentStatus::Failed);
    assert_eq!(h.record(&a1).await.status, DeploymentStatus::Running);

    h.wait_promoted(&a2).await;
    assert!(h.record(&a1).await.status.is_terminal());
}

// ---------------------------------------------------------------------------
// Admission
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn concurrent_requests_yield_one_conflict() {
    let h = harness();
    let agent = AgentId::generate();
    let source = h.source("v1").await;
    let request = DeploymentRequest::new(agent.clone(), owner(), source, "langgraph");

    let (a, b) = tokio::join!(
        h.controller.request_deployment(request.clone()),
        h.controller.request_deployment(request.clone())
    );
    let (accepted, rejected) = match (a, b) {
        (Ok(id), Err(e)) | (Err(e), Ok(id)) => (id, e),
        other => panic!("expected exactly one conflict, got {other:?}"),
    };
    match rejected {
        ControllerError::Conflict { in_flight, .. } => assert_eq!(in_flight, accepted.to_string()),
        other => panic!("expected conflict, got {other}"),
    }
    assert_eq!(h.controller.list_deployments(&agent).await.unwrap().len(), 1);

    // Once promoted the agent accepts the next rollout.
    h.wait_promoted(&accepted).await;
    h.controller.request_deployment(request).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn running_but_unpromoted_rollout_still_conflicts() {
    let h = harness();
    let agent = AgentId::generate();
    let d1 = h.deploy(&agent, "v1").await;
    h.wait_running(&d1).await;

    let source = h.source("v2").await;
    let err = h
        .controller
        .request_deployment(DeploymentRequest::new(agent, owner(), source, "langgraph"))
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::Conflict { .. }));
}

#[tokio::test(start_paused = true)]
async fn other_owner_cannot_deploy_to_an_agent() {
    let h = harness();
    let agent = AgentId::generate();
    let d1 = h.deploy(&agent, "v1").await;
    h.wait_promoted(&d1).await;

    let source = h.source("v2").await;
    let err = h
        .controller
        .request_deployment(DeploymentRequest::new(
            agent,
            OwnerId("someone-else".into()),
            source,
            "langgraph",
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::NotFound { .. }));
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn hung_build_fails_with_build_timeout() {
    let h = harness_with(|b| {
        b.with_packager(Arc::new(HangingPackager))
            .with_config(BuildConfig::default().with_timeout_secs(30))
    });
    let agent = AgentId::generate();
    let d1 = h.deploy(&agent, "v1").await;

    let record = h.wait_terminal(&d1).await;
    assert_eq!(record.status, DeploymentStatus::Failed);
    assert!(record
        .failure_reason
        .as_deref()
        .unwrap()
        .starts_with("BuildTimeout"));
    assert!(record.artifact.is_none());
    assert!(h.builder.catalog().list().await.unwrap().is_empty());
    assert!(matches!(
        ControllerError::from_failed(&record),
        Some(ControllerError::Build(BuildError::BuildTimeout { limit_secs: 30 }))
    ));
    assert_eq!(h.backend.launch_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn unknown_framework_fails_the_build() {
    let h = harness();
    let agent = AgentId::generate();
    let source = h.source("v1").await;
    let id = h
        .controller
        .request_deployment(DeploymentRequest::new(agent, owner(), source, "smolagents"))
        .await
        .unwrap();

    let record = h.wait_terminal(&id).await;
    assert_eq!(record.status, DeploymentStatus::Failed);
    assert!(record
        .failure_reason
        .as_deref()
        .unwrap()
        .starts_with("UnsupportedFramework"));
    assert!(h.kinds(&id).await.contains(&"build_failed".to_string()));
}

#[tokio::test(start_paused = true)]
async fn rejected_launch_fails_the_deployment() {
    let h = harness();
    h.backend.fail_next_launches(1);
    let agent = AgentId::generate();
    let d1 = h.deploy(&agent, "v1").await;

    let record = h.wait_terminal(&d1).await;
    assert_eq!(record.status, DeploymentStatus::Failed);
    assert!(record
        .failure_reason
        .as_deref()
        .unwrap()
        .starts_with("LaunchError"));
    assert!(record.artifact.is_some());
    assert!(h.controller.get_agent(&agent).await.unwrap().active_deployment.is_none());
}

#[tokio::test(start_paused = true)]
async fn crash_within_launch_grace_is_a_launch_failure() {
    let h = harness();
    h.backend.crash_on_launch(true);
    let agent = AgentId::generate();
    let d1 = h.deploy(&agent, "v1").await;

    let record = h.wait_terminal(&d1).await;
    assert_eq!(record.status, DeploymentStatus::Failed);
    assert!(matches!(
        ControllerError::from_failed(&record),
        Some(ControllerError::Launch { .. })
    ));
    assert_eq!(h.backend.instance_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn hung_launch_times_out() {
    let h = harness();
    h.backend.hang_launches(true);
    let agent = AgentId::generate();
    let d1 = h.deploy(&agent, "v1").await;

    let record = h.wait_terminal(&d1).await;
    assert_eq!(record.status, DeploymentStatus::Failed);
    assert!(record
        .failure_reason
        .as_deref()
        .unwrap()
        .contains("launch timed out"));
}

// ---------------------------------------------------------------------------
// Cancel, terminate, scale
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn cancelled_pending_deployment_never_builds() {
    let h = harness();
    let agent = AgentId::generate();
    let d1 = h.deploy(&agent, "v1").await;

    assert_eq!(
        h.controller.cancel_deployment(&d1).await.unwrap(),
        CancelOutcome::Cancelled
    );
    tokio::time::sleep(Duration::from_secs(5)).await;

    let record = h.record(&d1).await;
    assert_eq!(record.status, DeploymentStatus::Terminated);
    let kinds = h.kinds(&d1).await;
    assert!(!kinds.contains(&"build_started".to_string()));
    let statuses: Vec<_> = h
        .controller
        .history(&d1, 1)
        .await
        .unwrap()
        .iter()
        .filter_map(|e| DeploymentEvent::from_record(e).ok()?.new_status())
        .collect();
    assert_eq!(statuses, vec![DeploymentStatus::Terminated]);
    assert!(h.builder.catalog().list().await.unwrap().is_empty());
    assert_eq!(h.backend.launch_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_running_tears_down_and_is_idempotent() {
    let h = harness();
    let agent = AgentId::generate();
    let d1 = h.deploy(&agent, "v1").await;
    h.wait_promoted(&d1).await;

    assert_eq!(
        h.controller.cancel_deployment(&d1).await.unwrap(),
        CancelOutcome::Cancelled
    );
    let record = h.record(&d1).await;
    assert_eq!(record.status, DeploymentStatus::Terminated);
    assert_eq!(record.failure_reason.as_deref(), Some("cancelled by request"));
    assert!(!h.backend.is_running(&d1));
    assert!(h.controller.get_agent(&agent).await.unwrap().active_deployment.is_none());

    assert_eq!(
        h.controller.cancel_deployment(&d1).await.unwrap(),
        CancelOutcome::AlreadyFinal(DeploymentStatus::Terminated)
    );
}

#[tokio::test(start_paused = true)]
async fn failed_teardown_is_recorded_and_cancel_still_completes() {
    let h = harness();
    let agent = AgentId::generate();
    let d1 = h.deploy(&agent, "v1").await;
    h.wait_promoted(&d1).await;

    h.backend.fail_next_terminates(1);
    h.controller.cancel_deployment(&d1).await.unwrap();

    assert_eq!(h.record(&d1).await.status, DeploymentStatus::Terminated);
    let kinds = h.kinds(&d1).await;
    assert!(kinds.contains(&"teardown_failed".to_string()));
    assert_eq!(kinds.last().map(String::as_str), Some("status_changed"));
}

#[tokio::test(start_paused = true)]
async fn cancel_during_probation_keeps_predecessor_serving() {
    let h = harness();
    let agent = AgentId::generate();
    let d1 = h.deploy(&agent, "v1").await;
    h.wait_promoted(&d1).await;
    let d2 = h.deploy(&agent, "v2").await;
    h.wait_running(&d2).await;

    h.controller.cancel_deployment(&d2).await.unwrap();
    assert_eq!(h.record(&d2).await.status, DeploymentStatus::Terminated);
    assert!(h.controller.status(&d1).await.unwrap().active);
    assert!(h.backend.is_running(&d1));

    // The slot is free again right away.
    h.deploy(&agent, "v3").await;
}

#[tokio::test(start_paused = true)]
async fn terminate_agent_stops_everything() {
    let h = harness();
    let agent = AgentId::generate();
    let d1 = h.deploy(&agent, "v1").await;
    h.wait_promoted(&d1).await;
    let d2 = h.deploy(&agent, "v2").await;
    h.wait_running(&d2).await;

    let terminated = h.controller.terminate_agent(&agent).await.unwrap();
    assert!(terminated.is_terminated());
    assert!(terminated.active_deployment.is_none());
    for id in [&d1, &d2] {
        assert_eq!(h.record(id).await.status, DeploymentStatus::Terminated);
    }
    assert_eq!(h.backend.instance_count(), 0);

    let source = h.source("v3").await;
    let err = h
        .controller
        .request_deployment(DeploymentRequest::new(agent.clone(), owner(), source, "langgraph"))
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::AgentTerminated { .. }));

    h.controller.terminate_agent(&agent).await.unwrap();
    assert_eq!(
        h.controller
            .list_agents(Some(&owner()), Some("terminated"))
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn scale_rolls_out_new_limits_from_cache() {
    let h = harness();
    let agent = AgentId::generate();
    let d1 = h.deploy(&agent, "v1").await;
    let d1_record = h.wait_promoted(&d1).await;

    let limits = ResourceLimits {
        memory_mb: 1024,
        cpu_millis: 2000,
        replicas: 2,
    };
    let d2 = h.controller.scale(&agent, limits).await.unwrap();
    let d2_record = h.wait_promoted(&d2).await;

    assert_eq!(d2_record.limits, limits);
    assert_eq!(d2_record.source, d1_record.source);
    assert_eq!(d2_record.artifact, d1_record.artifact);
    let cached = h
        .controller
        .history(&d2, 1)
        .await
        .unwrap()
        .iter()
        .find_map(|e| match DeploymentEvent::from_record(e).ok()? {
            DeploymentEvent::BuildSucceeded { cached, .. } => Some(cached),
            _ => None,
        });
    assert_eq!(cached, Some(true));
    assert_eq!(h.record(&d1).await.status, DeploymentStatus::Terminated);
}

#[tokio::test(start_paused = true)]
async fn scale_without_any_deployment_is_not_found() {
    let h = harness();
    let agent = h
        .controller
        .register_agent(owner(), "idle-bot", Some("never deployed".into()))
        .await
        .unwrap();
    let err = h
        .controller
        .scale(&agent.agent_id, ResourceLimits::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::NotFound { .. }));
    assert_eq!(
        h.controller
            .list_agents(None, Some("idle"))
            .await
            .unwrap()
            .len(),
        1
    );
}
