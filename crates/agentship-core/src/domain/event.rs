//! Typed deployment events.
//!
//! Stored in the event log as `(kind, payload)` so the log stays readable by
//! tools that do not link this crate.

use serde::{Deserialize, Serialize};

use agentship_state::{AgentId, ContentDigest, DeploymentId, DeploymentStatus, EventRecord};

use crate::runtime::ResourceUsage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeploymentEvent {
    /// First event of every deployment.
    Requested {
        agent_id: AgentId,
        source: ContentDigest,
        framework_hint: String,
        predecessor: Option<DeploymentId>,
    },
    StatusChanged {
        from: DeploymentStatus,
        to: DeploymentStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    BuildStarted,
    BuildSucceeded {
        artifact: ContentDigest,
        cached: bool,
    },
    BuildFailed {
        error_kind: String,
        reason: String,
        log_ref: Option<ContentDigest>,
    },
    LaunchStarted {
        artifact: ContentDigest,
    },
    LaunchFailed {
        reason: String,
    },
    /// First health check after launch passed.
    Healthy {
        usage: ResourceUsage,
    },
    /// Probation window passed; the deployment now serves the agent.
    Promoted {
        retired: Option<DeploymentId>,
    },
    /// Written on the predecessor when a successor is promoted.
    Superseded {
        by: DeploymentId,
    },
    CrashDetected {
        reason: String,
    },
    /// Terminal: traffic went back to `restored`.
    RolledBack {
        restored: DeploymentId,
    },
    /// Terminal: crashed with nothing to fall back to.
    RuntimeCrashSurfaced {
        reason: String,
    },
    CancelRequested,
    TeardownFailed {
        reason: String,
    },
    /// Status corrected after a controller restart.
    Reconciled {
        reason: String,
    },
    ResourceUsage {
        usage: ResourceUsage,
    },
}

impl DeploymentEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            DeploymentEvent::Requested { .. } => "requested",
            DeploymentEvent::StatusChanged { .. } => "status_changed",
            DeploymentEvent::BuildStarted => "build_started",
            DeploymentEvent::BuildSucceeded { .. } => "build_succeeded",
            DeploymentEvent::BuildFailed { .. } => "build_failed",
            DeploymentEvent::LaunchStarted { .. } => "launch_started",
            DeploymentEvent::LaunchFailed { .. } => "launch_failed",
            DeploymentEvent::Healthy { .. } => "healthy",
            DeploymentEvent::Promoted { .. } => "promoted",
            DeploymentEvent::Superseded { .. } => "superseded",
            DeploymentEvent::CrashDetected { .. } => "crash_detected",
            DeploymentEvent::RolledBack { .. } => "rolled_back",
            DeploymentEvent::RuntimeCrashSurfaced { .. } => "runtime_crash_surfaced",
            DeploymentEvent::CancelRequested => "cancel_requested",
            DeploymentEvent::TeardownFailed { .. } => "teardown_failed",
            DeploymentEvent::Reconciled { .. } => "reconciled",
            DeploymentEvent::ResourceUsage { .. } => "resource_usage",
        }
    }

    /// Event body without the `kind` tag.
    pub fn payload(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        if let Some(obj) = value.as_object_mut() {
            obj.remove("kind");
        }
        value
    }

    /// Decode a stored record. Unknown kinds yield an error.
    pub fn from_record(record: &EventRecord) -> serde_json::Result<Self> {
        let mut value = match &record.payload {
            serde_json::Value::Object(obj) => serde_json::Value::Object(obj.clone()),
            _ => serde_json::Value::Object(serde_json::Map::new()),
        };
        if let Some(obj) = value.as_object_mut() {
            obj.insert("kind".into(), serde_json::Value::String(record.kind.clone()));
        }
        serde_json::from_value(value)
    }

    /// Status the deployment entered, for events that change it.
    pub fn new_status(&self) -> Option<DeploymentStatus> {
        match self {
            DeploymentEvent::StatusChanged { to, .. } => Some(*to),
            DeploymentEvent::RolledBack { .. } => Some(DeploymentStatus::RolledBack),
            DeploymentEvent::RuntimeCrashSurfaced { .. } => Some(DeploymentStatus::Failed),
            _ => None,
        }
    }
}

/// Whether a stored event moved its deployment into a terminal status.
pub fn ends_deployment(record: &EventRecord) -> bool {
    DeploymentEvent::from_record(record)
        .ok()
        .and_then(|e| e.new_status())
        .is_some_and(|s| s.is_terminal())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(event: &DeploymentEvent) -> EventRecord {
        EventRecord {
            deployment_id: DeploymentId::new(),
            seq: 1,
            kind: event.kind().to_string(),
            payload: event.payload(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn payload_omits_kind_and_decodes_back() {
        let event = DeploymentEvent::StatusChanged {
            from: DeploymentStatus::Pending,
            to: DeploymentStatus::Building,
            reason: None,
        };
        let payload = event.payload();
        assert!(payload.get("kind").is_none());
        assert_eq!(payload["to"], "building");
        assert_eq!(DeploymentEvent::from_record(&record(&event)).unwrap(), event);
    }

    #[test]
    fn unit_variants_decode() {
        let event = DeploymentEvent::CancelRequested;
        assert_eq!(event.payload(), serde_json::json!({}));
        assert_eq!(DeploymentEvent::from_record(&record(&event)).unwrap(), event);
    }

    #[test]
    fn kind_matches_serde_tag() {
        let event = DeploymentEvent::RuntimeCrashSurfaced {
            reason: "oom".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], event.kind());
    }

    #[test]
    fn terminal_events_end_the_stream() {
        let rolled = DeploymentEvent::RolledBack {
            restored: DeploymentId::new(),
        };
        assert!(ends_deployment(&record(&rolled)));

        let running = DeploymentEvent::StatusChanged {
            from: DeploymentStatus::Launching,
            to: DeploymentStatus::Running,
            reason: None,
        };
        assert!(!ends_deployment(&record(&running)));

        let cancelled = DeploymentEvent::StatusChanged {
            from: DeploymentStatus::Running,
            to: DeploymentStatus::Terminated,
            reason: Some("cancelled by request".into()),
        };
        assert!(ends_deployment(&record(&cancelled)));
    }
}
