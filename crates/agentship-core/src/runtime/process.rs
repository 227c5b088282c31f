//! Runs deployments as local OS processes.
//!
//! The artifact's image manifest names a source snapshot and a command line.
//! Launch materializes the snapshot into a private working directory and
//! spawns one process per replica. Resource limits are advisory here: they
//! are exported to the process environment and logged, not enforced.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use agentship_build::{ImageManifest, SourceSnapshot};
use agentship_state::CasStore;

use super::{
    BackendError, BackendHandle, HealthReport, HealthState, LaunchRequest, ResourceUsage,
    RuntimeBackend,
};

struct Launched {
    children: Vec<Child>,
    // Dropped (and removed from disk) together with the processes.
    _workdir: TempDir,
}

pub struct ProcessBackend {
    cas: Arc<dyn CasStore>,
    launched: Mutex<HashMap<BackendHandle, Launched>>,
}

impl ProcessBackend {
    pub fn new(cas: Arc<dyn CasStore>) -> Self {
        Self {
            cas,
            launched: Mutex::new(HashMap::new()),
        }
    }

    async fn load(&self, request: &LaunchRequest) -> Result<(ImageManifest, SourceSnapshot), BackendError> {
        let bytes = self.cas.get(&request.artifact).await?;
        let manifest = ImageManifest::from_bytes(&bytes).map_err(|e| {
            BackendError::Rejected(format!(
                "artifact {} is not an image manifest: {e}",
                request.artifact.short()
            ))
        })?;
        let bytes = self.cas.get(&manifest.source).await?;
        let snapshot = SourceSnapshot::from_bytes(&bytes).map_err(|e| {
            BackendError::Rejected(format!("snapshot {}: {e}", manifest.source.short()))
        })?;
        Ok((manifest, snapshot))
    }
}

#[async_trait]
impl RuntimeBackend for ProcessBackend {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn launch(&self, request: &LaunchRequest) -> Result<BackendHandle, BackendError> {
        let (manifest, snapshot) = self.load(request).await?;
        let (exe, args) = manifest
            .command
            .split_first()
            .ok_or_else(|| BackendError::Rejected("image manifest has an empty command".into()))?;

        let workdir = tempfile::Builder::new().prefix("agentship-").tempdir()?;
        let dest = workdir.path().to_path_buf();
        tokio::task::spawn_blocking(move || snapshot.materialize(&dest))
            .await
            .map_err(|e| BackendError::Unavailable(format!("materialize task: {e}")))??;

        let replicas = request.limits.replicas.max(1);
        info!(
            deployment_id = %request.deployment_id,
            artifact = %request.artifact.short(),
            replicas,
            memory_mb = request.limits.memory_mb,
            cpu_millis = request.limits.cpu_millis,
            "launching agent processes"
        );

        let mut children = Vec::with_capacity(replicas as usize);
        for replica in 0..replicas {
            let child = Command::new(exe)
                .args(args)
                .current_dir(workdir.path())
                .envs(&request.env)
                .env("AGENTSHIP_DEPLOYMENT_ID", request.deployment_id.as_str())
                .env("AGENTSHIP_MEMORY_MB", request.limits.memory_mb.to_string())
                .env("AGENTSHIP_CPU_MILLIS", request.limits.cpu_millis.to_string())
                .env("AGENTSHIP_REPLICA", replica.to_string())
                .stdin(Stdio::null())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| BackendError::Rejected(format!("spawn {exe}: {e}")))?;
            debug!(deployment_id = %request.deployment_id, replica, pid = ?child.id(), "spawned");
            children.push(child);
        }

        let handle = BackendHandle(format!("proc-{}", request.deployment_id));
        self.launched.lock().await.insert(
            handle.clone(),
            Launched {
                children,
                _workdir: workdir,
            },
        );
        Ok(handle)
    }

    async fn health_check(&self, handle: &BackendHandle) -> Result<HealthReport, BackendError> {
        let mut launched = self.launched.lock().await;
        let entry = launched
            .get_mut(handle)
            .ok_or_else(|| BackendError::UnknownHandle(handle.to_string()))?;

        let mut usage = ResourceUsage::default();
        for (replica, child) in entry.children.iter_mut().enumerate() {
            if let Some(status) = child.try_wait()? {
                let state = if status.success() {
                    HealthState::Exited
                } else {
                    HealthState::Crashed
                };
                return Ok(HealthReport {
                    state,
                    usage,
                    detail: Some(format!("replica {replica} {status}")),
                });
            }
            if let Some(mb) = child.id().and_then(resident_mb) {
                usage.memory_mb = Some(usage.memory_mb.unwrap_or(0) + mb);
            }
        }
        Ok(HealthReport::running(usage))
    }

    async fn terminate(&self, handle: &BackendHandle) -> Result<(), BackendError> {
        let Some(mut entry) = self.launched.lock().await.remove(handle) else {
            return Ok(());
        };
        for child in entry.children.iter_mut() {
            if let Err(e) = child.kill().await {
                // Already reaped processes report InvalidInput.
                if e.kind() != std::io::ErrorKind::InvalidInput {
                    warn!(handle = %handle, error = %e, "failed to kill agent process");
                    return Err(e.into());
                }
            }
        }
        info!(handle = %handle, "agent processes stopped");
        Ok(())
    }

    async fn running(&self) -> Result<Vec<BackendHandle>, BackendError> {
        let mut handles: Vec<_> = self.launched.lock().await.keys().cloned().collect();
        handles.sort();
        Ok(handles)
    }
}

/// Resident set size of a process in MiB, when `/proc` is available.
fn resident_mb(pid: u32) -> Option<u64> {
    let statm = std::fs::read_to_string(format!("/proc/{pid}/statm")).ok()?;
    let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(pages * 4096 / (1024 * 1024))
}
