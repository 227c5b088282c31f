//! Per-deployment event streams observed through the controller.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

use agentship_build::{BuildEngine, SourceSnapshot};
use agentship_core::{
    ends_deployment, Controller, ControllerConfig, ControllerError, DeploymentRequest,
    MemoryBackend,
};
use agentship_state::fakes::{
    MemoryArtifactCatalog, MemoryCasStore, MemoryDeploymentStore, MemoryEventLog,
};
use agentship_state::{AgentId, DeploymentId, EventRecord, OwnerId};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn controller() -> (Controller, BuildEngine) {
    let builder = BuildEngine::new(
        Arc::new(MemoryCasStore::new()),
        Arc::new(MemoryArtifactCatalog::new()),
    );
    let controller = Controller::new(
        Arc::new(MemoryDeploymentStore::new()),
        Arc::new(MemoryEventLog::new()),
        builder.clone(),
        Arc::new(MemoryBackend::new()),
        ControllerConfig::default()
            .with_launch_grace_ms(100)
            .with_promotion_window_ms(2_000)
            .with_health_interval_ms(500),
    );
    (controller, builder)
}

async fn deploy(controller: &Controller, builder: &BuildEngine) -> DeploymentId {
    let snapshot = SourceSnapshot::new()
        .with_file("agent.py", "print('hi')")
        .unwrap();
    let source = builder.submit_snapshot(&snapshot).await.unwrap();
    controller
        .request_deployment(DeploymentRequest::new(
            AgentId::generate(),
            OwnerId("user-1".into()),
            source,
            "langchain",
        ))
        .await
        .unwrap()
}

/// Collect until the deployment is promoted or ends.
async fn collect_rollout(controller: &Controller, id: &DeploymentId, from: u64) -> Vec<EventRecord> {
    let mut stream = controller.stream_events(id, from).await.unwrap();
    let mut seen = Vec::new();
    while let Some(event) = stream.next().await {
        let event = event.unwrap();
        let done = event.kind == "promoted" || ends_deployment(&event);
        seen.push(event);
        if done {
            break;
        }
    }
    seen
}

fn assert_gap_free(events: &[EventRecord], first: u64) {
    for (offset, event) in events.iter().enumerate() {
        assert_eq!(event.seq, first + offset as u64, "gap before {}", event.kind);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn live_stream_sees_the_whole_rollout_in_order() {
    let (controller, builder) = controller();
    let id = deploy(&controller, &builder).await;

    let events = collect_rollout(&controller, &id, 1).await;
    let kinds: Vec<_> = events.iter().map(|e| e.kind.as_str()).collect();
    assert_eq!(
        kinds,
        [
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
    assert_gap_free(&events, 1);
    assert!(events.iter().all(|e| e.deployment_id == id));

    // Late subscribers replay the same persisted sequence.
    let replayed = controller.history(&id, 1).await.unwrap();
    assert_eq!(replayed, events);
}

#[tokio::test(start_paused = true)]
async fn subscribing_mid_stream_starts_at_the_requested_seq() {
    let (controller, builder) = controller();
    let id = deploy(&controller, &builder).await;
    collect_rollout(&controller, &id, 1).await;

    let tail = collect_rollout(&controller, &id, 5).await;
    assert_eq!(tail.first().map(|e| e.seq), Some(5));
    assert_gap_free(&tail, 5);
    assert_eq!(tail.last().map(|e| e.kind.as_str()), Some("promoted"));
}

#[tokio::test(start_paused = true)]
async fn cancelled_deployment_stream_ends_with_terminal_status() {
    let (controller, builder) = controller();
    let id = deploy(&controller, &builder).await;
    let mut stream = controller.stream_events(&id, 1).await.unwrap();

    let canceller = controller.clone();
    let target = id.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        canceller.cancel_deployment(&target).await.unwrap();
    });

    let mut last = None;
    while let Some(event) = stream.next().await {
        let event = event.unwrap();
        if ends_deployment(&event) {
            last = Some(event);
            break;
        }
    }
    let last = last.expect("stream should report the terminal transition");
    assert_eq!(last.kind, "status_changed");
    assert_eq!(last.payload["to"], "terminated");
    assert_eq!(controller.status(&id).await.unwrap().last_seq, last.seq);
}

#[tokio::test(start_paused = true)]
async fn events_of_unknown_deployment_are_not_found() {
    let (controller, _) = controller();
    let missing = DeploymentId("dpl_missing".into());
    assert!(matches!(
        controller.stream_events(&missing, 1).await,
        Err(ControllerError::NotFound { .. })
    ));
    assert!(matches!(
        controller.history(&missing, 1).await,
        Err(ControllerError::NotFound { .. })
    ));
}
