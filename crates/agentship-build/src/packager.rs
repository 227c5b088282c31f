//! Packagers turn a resolved snapshot into an image manifest.

use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info};

use agentship_state::ContentDigest;

use crate::framework::FrameworkProfile;
use crate::snapshot::SourceSnapshot;

/// Manifest format version written into every image manifest.
pub const MANIFEST_FORMAT: u32 = 1;

/// The built artifact: everything a runtime backend needs to start the agent.
///
/// Serialized with a fixed field order, so identical inputs produce identical
/// bytes and therefore the same artifact hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageManifest {
    pub format: u32,
    pub framework: String,
    /// Full command line (runtime followed by entrypoint)
    pub command: Vec<String>,
    pub entrypoint: String,
    /// Snapshot the image runs from
    pub source: ContentDigest,
    pub dependency_files: Vec<String>,
    pub file_count: usize,
    /// Build command that produced the image, if any
    pub build_command: Option<Vec<String>>,
}

impl ImageManifest {
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// Inputs of one packaging run.
#[derive(Debug, Clone)]
pub struct PackageRequest {
    pub source: ContentDigest,
    pub snapshot: SourceSnapshot,
    pub profile: FrameworkProfile,
}

#[derive(Debug, Clone)]
pub struct PackageOutput {
    pub manifest: ImageManifest,
    /// Captured build log
    pub log: String,
}

#[derive(Debug, Clone)]
pub struct PackageFailure {
    pub reason: String,
    pub log: String,
}

impl PackageFailure {
    fn new(reason: impl Into<String>, log: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            log: log.into(),
        }
    }
}

#[async_trait]
pub trait Packager: Send + Sync {
    /// Identifies the packaging recipe; part of the build cache key.
    fn fingerprint(&self) -> String;

    async fn package(&self, request: &PackageRequest) -> Result<PackageOutput, PackageFailure>;
}

// ---------------------------------------------------------------------------
// ManifestPackager
// ---------------------------------------------------------------------------

/// Writes an image manifest straight from the snapshot. No external tools.
#[derive(Debug, Clone, Default)]
pub struct ManifestPackager;

impl ManifestPackager {
    pub fn plan(
        request: &PackageRequest,
        build_command: Option<Vec<String>>,
    ) -> Result<ImageManifest, PackageFailure> {
        let entrypoint = request
            .profile
            .entrypoints
            .iter()
            .find(|e| request.snapshot.contains(e))
            .cloned()
            .ok_or_else(|| {
                PackageFailure::new(
                    format!(
                        "no entrypoint found (tried {})",
                        request.profile.entrypoints.join(", ")
                    ),
                    "",
                )
            })?;

        let mut command = request.profile.runtime.clone();
        command.push(entrypoint.clone());

        Ok(ImageManifest {
            format: MANIFEST_FORMAT,
            framework: request.profile.name.clone(),
            command,
            entrypoint,
            source: request.source.clone(),
            dependency_files: request.snapshot.dependency_files(),
            file_count: request.snapshot.len(),
            build_command,
        })
    }
}

#[async_trait]
impl Packager for ManifestPackager {
    fn fingerprint(&self) -> String {
        format!("manifest/v{MANIFEST_FORMAT}")
    }

    async fn package(&self, request: &PackageRequest) -> Result<PackageOutput, PackageFailure> {
        let manifest = Self::plan(request, None)?;
        let log = format!(
            "framework: {}\nentrypoint: {}\nfiles: {}\ndependencies: {}\n",
            manifest.framework,
            manifest.entrypoint,
            manifest.file_count,
            manifest.dependency_files.join(", ")
        );
        Ok(PackageOutput { manifest, log })
    }
}

// ---------------------------------------------------------------------------
// CommandPackager
// ---------------------------------------------------------------------------

/// An external build step such as `docker build`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildCommand {
    /// Human-readable step name.
    pub name: String,

    /// Command to execute (first element is executable).
    ///
    /// `{source}` and `{framework}` are replaced with the short source
    /// digest and the framework name.
    pub command: Vec<String>,
}

impl BuildCommand {
    pub fn new(name: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            name: name.into(),
            command,
        }
    }

    /// `docker build -t agentship/<framework>:<source> .`
    pub fn docker() -> Self {
        Self::new(
            "docker_build",
            vec![
                "docker".to_string(),
                "build".to_string(),
                "-t".to_string(),
                "agentship/{framework}:{source}".to_string(),
                ".".to_string(),
            ],
        )
    }

    fn render(&self, request: &PackageRequest) -> Vec<String> {
        self.command
            .iter()
            .map(|arg| {
                arg.replace("{source}", request.source.short())
                    .replace("{framework}", &request.profile.name)
            })
            .collect()
    }
}

/// Runs a build command inside a materialized copy of the snapshot.
///
/// The child is killed when the packaging future is dropped, so the engine's
/// timeout and cancellation stop it.
#[derive(Debug, Clone)]
pub struct CommandPackager {
    step: BuildCommand,
}

impl CommandPackager {
    pub fn new(step: BuildCommand) -> Self {
        Self { step }
    }
}

#[async_trait]
impl Packager for CommandPackager {
    fn fingerprint(&self) -> String {
        format!("command/{}", self.step.command.join(" "))
    }

    async fn package(&self, request: &PackageRequest) -> Result<PackageOutput, PackageFailure> {
        let start = Instant::now();
        let argv = self.step.render(request);
        let (exe, args) = argv
            .split_first()
            .ok_or_else(|| PackageFailure::new(format!("step {} has empty command", self.step.name), ""))?;

        let workdir = tempfile::tempdir()
            .map_err(|e| PackageFailure::new(format!("workdir: {e}"), ""))?;
        let snapshot = request.snapshot.clone();
        let dest = workdir.path().to_path_buf();
        tokio::task::spawn_blocking(move || snapshot.materialize(&dest))
            .await
            .map_err(|e| PackageFailure::new(format!("materialize task: {e}"), ""))?
            .map_err(|e| PackageFailure::new(format!("materialize snapshot: {e}"), ""))?;

        info!(step = %self.step.name, source = %request.source.short(), "running build step");

        let child = Command::new(exe)
            .args(args)
            .current_dir(workdir.path())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PackageFailure::new(format!("spawn {exe}: {e}"), ""))?;

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| PackageFailure::new(format!("wait for {exe}: {e}"), ""))?;

        let duration_ms = start.elapsed().as_millis() as u64;
        let exit_code = output.status.code().unwrap_or(-1);
        let log = format!(
            "$ {}\n{}{}\n[exit {} after {}ms]\n",
            argv.join(" "),
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr),
            exit_code,
            duration_ms
        );
        debug!(step = %self.step.name, exit_code, duration_ms, "build step finished");

        if !output.status.success() {
            return Err(PackageFailure::new(
                format!("step {} exited with code {}", self.step.name, exit_code),
                log,
            ));
        }

        let manifest = ManifestPackager::plan(request, Some(argv.clone()))
            .map_err(|f| PackageFailure::new(f.reason, log.clone()))?;
        Ok(PackageOutput { manifest, log })
    }
}
