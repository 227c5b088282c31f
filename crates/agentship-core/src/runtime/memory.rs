//! In-memory runtime backend with scriptable failures.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use agentship_state::DeploymentId;

use super::{
    BackendError, BackendHandle, HealthReport, HealthState, LaunchRequest, ResourceUsage,
    RuntimeBackend,
};

#[derive(Debug, Clone)]
struct Instance {
    deployment_id: DeploymentId,
    state: HealthState,
    usage: ResourceUsage,
    detail: Option<String>,
}

#[derive(Debug, Default)]
struct State {
    next_handle: u64,
    instances: HashMap<BackendHandle, Instance>,
    launches: u64,
    fail_launches: u32,
    fail_terminates: u32,
    crash_on_launch: bool,
    hang_launches: bool,
}

/// Backend that "runs" deployments as entries in a map.
///
/// Tests drive it with `crash`, `exit`, `fail_next_launches` and friends.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark an instance as crashed. Returns false for unknown handles.
    pub fn crash(&self, handle: &BackendHandle, reason: &str) -> bool {
        self.set_state(handle, HealthState::Crashed, reason)
    }

    /// Crash the live instance of a deployment.
    pub fn crash_deployment(&self, deployment_id: &DeploymentId, reason: &str) -> bool {
        match self.handle_for(deployment_id) {
            Some(handle) => self.crash(&handle, reason),
            None => false,
        }
    }

    /// Mark an instance as exited on its own.
    pub fn exit(&self, handle: &BackendHandle, detail: &str) -> bool {
        self.set_state(handle, HealthState::Exited, detail)
    }

    pub fn fail_next_launches(&self, n: u32) {
        self.state.lock().unwrap().fail_launches = n;
    }

    pub fn fail_next_terminates(&self, n: u32) {
        self.state.lock().unwrap().fail_terminates = n;
    }

    /// Launches succeed but the instance is already dead at first health check.
    pub fn crash_on_launch(&self, enabled: bool) {
        self.state.lock().unwrap().crash_on_launch = enabled;
    }

    /// Launches never return.
    pub fn hang_launches(&self, enabled: bool) {
        self.state.lock().unwrap().hang_launches = enabled;
    }

    pub fn set_usage(&self, handle: &BackendHandle, usage: ResourceUsage) {
        if let Some(instance) = self.state.lock().unwrap().instances.get_mut(handle) {
            instance.usage = usage;
        }
    }

    /// Register an instance as if it had been launched earlier, e.g. before a
    /// controller restart.
    pub fn insert_running(&self, deployment_id: &DeploymentId) -> BackendHandle {
        let mut state = self.state.lock().unwrap();
        let handle = next_handle(&mut state);
        state.instances.insert(
            handle.clone(),
            Instance {
                deployment_id: deployment_id.clone(),
                state: HealthState::Running,
                usage: ResourceUsage::default(),
                detail: None,
            },
        );
        handle
    }

    /// Handle of the instance backing a deployment, if one exists.
    pub fn handle_for(&self, deployment_id: &DeploymentId) -> Option<BackendHandle> {
        self.state
            .lock()
            .unwrap()
            .instances
            .iter()
            .find(|(_, i)| &i.deployment_id == deployment_id)
            .map(|(h, _)| h.clone())
    }

    /// Whether a healthy instance exists for the deployment.
    pub fn is_running(&self, deployment_id: &DeploymentId) -> bool {
        self.state
            .lock()
            .unwrap()
            .instances
            .values()
            .any(|i| &i.deployment_id == deployment_id && i.state == HealthState::Running)
    }

    pub fn instance_count(&self) -> usize {
        self.state.lock().unwrap().instances.len()
    }

    pub fn launch_count(&self) -> u64 {
        self.state.lock().unwrap().launches
    }

    fn set_state(&self, handle: &BackendHandle, to: HealthState, detail: &str) -> bool {
        match self.state.lock().unwrap().instances.get_mut(handle) {
            Some(instance) => {
                instance.state = to;
                instance.detail = Some(detail.to_string());
                true
            }
            None => false,
        }
    }
}

fn next_handle(state: &mut State) -> BackendHandle {
    state.next_handle += 1;
    BackendHandle(format!("mem-{}", state.next_handle))
}

#[async_trait]
impl RuntimeBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn launch(&self, request: &LaunchRequest) -> Result<BackendHandle, BackendError> {
        let hang = {
            let mut state = self.state.lock().unwrap();
            state.launches += 1;
            if state.fail_launches > 0 {
                state.fail_launches -= 1;
                return Err(BackendError::Rejected("injected launch failure".into()));
            }
            state.hang_launches
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let mut state = self.state.lock().unwrap();
        let handle = next_handle(&mut state);
        let (health, detail) = if state.crash_on_launch {
            (HealthState::Crashed, Some("crashed during startup".to_string()))
        } else {
            (HealthState::Running, None)
        };
        state.instances.insert(
            handle.clone(),
            Instance {
                deployment_id: request.deployment_id.clone(),
                state: health,
                usage: ResourceUsage::default(),
                detail,
            },
        );
        Ok(handle)
    }

    async fn health_check(&self, handle: &BackendHandle) -> Result<HealthReport, BackendError> {
        let state = self.state.lock().unwrap();
        let instance = state
            .instances
            .get(handle)
            .ok_or_else(|| BackendError::UnknownHandle(handle.to_string()))?;
        Ok(HealthReport {
            state: instance.state,
            usage: instance.usage,
            detail: instance.detail.clone(),
        })
    }

    async fn terminate(&self, handle: &BackendHandle) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_terminates > 0 {
            state.fail_terminates -= 1;
            return Err(BackendError::Unavailable("injected terminate failure".into()));
        }
        state.instances.remove(handle);
        Ok(())
    }

    async fn running(&self) -> Result<Vec<BackendHandle>, BackendError> {
        let mut handles: Vec<_> = self.state.lock().unwrap().instances.keys().cloned().collect();
        handles.sort();
        Ok(handles)
    }
}
