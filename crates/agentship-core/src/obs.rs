//! Structured observability hooks for deployment lifecycle events.
//!
//! This module provides:
//! - Deployment-scoped tracing spans via the `DeploymentSpan` RAII guard
//! - Emission functions for the lifecycle moments operators care about
//!
//! Events are emitted at `info!` level, crashes and teardown problems at
//! `warn!`. Filter with `RUST_LOG`; pass `--json` to the CLI for JSON lines.

use tracing::{info, warn};

/// RAII guard that enters a deployment-scoped span.
///
/// Only use this in synchronous sections; async code should attach
/// [`deployment_span`] with `Instrument`.
pub struct DeploymentSpan {
    _span: tracing::span::EnteredSpan,
}

impl DeploymentSpan {
    pub fn enter(deployment_id: &str, agent_id: &str) -> Self {
        Self {
            _span: deployment_span(deployment_id, agent_id).entered(),
        }
    }
}

/// Span tagged with the deployment and agent ids.
pub fn deployment_span(deployment_id: &str, agent_id: &str) -> tracing::Span {
    tracing::info_span!("agentship.deployment", deployment_id = %deployment_id, agent_id = %agent_id)
}

pub fn emit_deployment_requested(deployment_id: &str, agent_id: &str, framework_hint: &str) {
    info!(
        event = "deployment.requested",
        deployment_id = %deployment_id,
        agent_id = %agent_id,
        framework = %framework_hint,
    );
}

pub fn emit_status_changed(deployment_id: &str, from: &str, to: &str) {
    info!(event = "deployment.status_changed", deployment_id = %deployment_id, from = %from, to = %to);
}

pub fn emit_promoted(deployment_id: &str, retired: Option<&str>) {
    info!(event = "deployment.promoted", deployment_id = %deployment_id, retired = ?retired);
}

pub fn emit_rollback(deployment_id: &str, restored: &str, reason: &str) {
    warn!(
        event = "deployment.rolled_back",
        deployment_id = %deployment_id,
        restored = %restored,
        reason = %reason,
    );
}

/// Crash with no fallback. Operators need to act on these.
pub fn emit_runtime_crash_surfaced(deployment_id: &str, agent_id: &str, reason: &str) {
    warn!(
        event = "deployment.runtime_crash",
        deployment_id = %deployment_id,
        agent_id = %agent_id,
        reason = %reason,
    );
}

pub fn emit_event_appended(deployment_id: &str, kind: &str, seq: u64) {
    tracing::debug!(event = "deployment.event_appended", deployment_id = %deployment_id, kind = %kind, seq = seq);
}

pub fn emit_teardown_failed(deployment_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "deployment.teardown_failed", deployment_id = %deployment_id, error = %error);
}

pub fn emit_reconciled(deployment_id: &str, from: &str, to: &str, reason: &str) {
    info!(
        event = "deployment.reconciled",
        deployment_id = %deployment_id,
        from = %from,
        to = %to,
        reason = %reason,
    );
}
