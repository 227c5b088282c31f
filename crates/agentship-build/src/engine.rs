//! Build engine: snapshot + framework hint -> artifact.

use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use agentship_state::{
    ArtifactCatalog, ArtifactRecord, CasStore, ContentDigest, StorageError, StorageResult,
};

use crate::config::BuildConfig;
use crate::error::BuildError;
use crate::framework::{BuiltinFrameworks, FrameworkProfile, FrameworkResolver};
use crate::packager::{ManifestPackager, PackageRequest, Packager};
use crate::snapshot::SourceSnapshot;

/// Result of a successful build.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildOutcome {
    pub artifact: ArtifactRecord,
    /// Whether the artifact came from the build cache
    pub cached: bool,
}

/// Builds artifacts from snapshots stored in the CAS.
///
/// Steps, in order:
/// 1. load the snapshot (`InvalidSource`)
/// 2. resolve the framework hint (`UnsupportedFramework`)
/// 3. reuse a cached artifact for the same build key
/// 4. package under the timeout, racing cancellation (`BuildTimeout`, `Cancelled`, `BuildFailed`)
/// 5. store manifest and log with retry, then record the artifact
#[derive(Clone)]
pub struct BuildEngine {
    cas: Arc<dyn CasStore>,
    catalog: Arc<dyn ArtifactCatalog>,
    resolver: Arc<dyn FrameworkResolver>,
    packager: Arc<dyn Packager>,
    config: BuildConfig,
}

impl BuildEngine {
    /// Engine with the builtin frameworks and the manifest packager.
    pub fn new(cas: Arc<dyn CasStore>, catalog: Arc<dyn ArtifactCatalog>) -> Self {
        Self {
            cas,
            catalog,
            resolver: Arc::new(BuiltinFrameworks::new()),
            packager: Arc::new(ManifestPackager),
            config: BuildConfig::default(),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn FrameworkResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_packager(mut self, packager: Arc<dyn Packager>) -> Self {
        self.packager = packager;
        self
    }

    pub fn with_config(mut self, config: BuildConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    pub fn cas(&self) -> &Arc<dyn CasStore> {
        &self.cas
    }

    pub fn catalog(&self) -> &Arc<dyn ArtifactCatalog> {
        &self.catalog
    }

    /// Store a snapshot in the CAS, returning its digest.
    pub async fn submit_snapshot(&self, snapshot: &SourceSnapshot) -> StorageResult<ContentDigest> {
        self.store_with_retry("snapshot", &snapshot.to_bytes()).await
    }

    /// Load and decode a snapshot.
    pub async fn load_snapshot(&self, source: &ContentDigest) -> Result<SourceSnapshot, BuildError> {
        let bytes = self.cas.get(source).await.map_err(|e| match e {
            StorageError::NotFound { .. } => BuildError::InvalidSource {
                reason: format!("snapshot {} not found", source.short()),
            },
            other => BuildError::InvalidSource {
                reason: format!("snapshot {} unreadable: {other}", source.short()),
            },
        })?;
        SourceSnapshot::from_bytes(&bytes).map_err(|reason| BuildError::InvalidSource { reason })
    }

    /// Build the artifact for `source` under `framework_hint`.
    pub async fn build(
        &self,
        source: &ContentDigest,
        framework_hint: &str,
        cancel: &CancellationToken,
    ) -> Result<BuildOutcome, BuildError> {
        if cancel.is_cancelled() {
            return Err(BuildError::Cancelled);
        }

        let snapshot = self.load_snapshot(source).await?;
        let profile = self.resolver.resolve(framework_hint).ok_or_else(|| {
            BuildError::UnsupportedFramework {
                hint: framework_hint.to_string(),
            }
        })?;

        let build_key = self.build_key(source, &profile);
        if let Some(artifact) = self.cached(&build_key).await {
            info!(
                artifact = %artifact.hash.short(),
                source = %source.short(),
                "build cache hit"
            );
            return Ok(BuildOutcome {
                artifact,
                cached: true,
            });
        }

        info!(source = %source.short(), framework = %profile.name, "packaging");
        let request = PackageRequest {
            source: source.clone(),
            snapshot,
            profile,
        };

        let packaged = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BuildError::Cancelled),
            res = tokio::time::timeout(self.config.timeout(), self.packager.package(&request)) => res,
        };

        let output = match packaged {
            Err(_elapsed) => {
                warn!(source = %source.short(), limit_secs = self.config.timeout_secs, "build timed out");
                return Err(BuildError::BuildTimeout {
                    limit_secs: self.config.timeout_secs,
                });
            }
            Ok(Err(failure)) => {
                let log_ref = match self.store_with_retry("build log", failure.log.as_bytes()).await {
                    Ok(d) => Some(d),
                    Err(e) => {
                        warn!(error = %e, "could not store log of failed build");
                        None
                    }
                };
                return Err(BuildError::BuildFailed {
                    reason: failure.reason,
                    log_ref,
                });
            }
            Ok(Ok(output)) => output,
        };

        // Nothing reaches the CAS once cancelled.
        if cancel.is_cancelled() {
            return Err(BuildError::Cancelled);
        }

        let manifest_bytes = output.manifest.to_bytes();
        let hash = self
            .store_with_retry("image manifest", &manifest_bytes)
            .await
            .map_err(|e| BuildError::BuildFailed {
                reason: format!("storing image manifest: {e}"),
                log_ref: None,
            })?;
        let build_log = self
            .store_with_retry("build log", output.log.as_bytes())
            .await
            .map_err(|e| BuildError::BuildFailed {
                reason: format!("storing build log: {e}"),
                log_ref: None,
            })?;

        let record = ArtifactRecord {
            hash,
            size: manifest_bytes.len() as u64,
            build_log,
            framework: output.manifest.framework.clone(),
            source: source.clone(),
            build_key,
            created_at: Utc::now(),
        };
        let artifact = self
            .catalog
            .record(&record)
            .await
            .map_err(|e| BuildError::BuildFailed {
                reason: format!("recording artifact: {e}"),
                log_ref: Some(record.build_log.clone()),
            })?;

        info!(artifact = %artifact.hash.short(), size = artifact.size, "artifact built");
        Ok(BuildOutcome {
            artifact,
            cached: false,
        })
    }

    /// Cache key over (snapshot, resolved framework, packaging recipe).
    pub fn build_key(&self, source: &ContentDigest, profile: &FrameworkProfile) -> ContentDigest {
        let mut hasher = Sha256::new();
        hasher.update(source.as_str().as_bytes());
        hasher.update(b"\0");
        hasher.update(profile.name.as_bytes());
        hasher.update(b"\0");
        hasher.update(profile.runtime.join(" ").as_bytes());
        hasher.update(b"\0");
        hasher.update(self.packager.fingerprint().as_bytes());
        ContentDigest::from_bytes(&hasher.finalize())
    }

    async fn cached(&self, build_key: &ContentDigest) -> Option<ArtifactRecord> {
        let artifact = match self.catalog.find_by_build_key(build_key).await {
            Ok(found) => found?,
            Err(e) => {
                warn!(error = %e, "build cache lookup failed, rebuilding");
                return None;
            }
        };
        // Only trust the cache when the manifest blob is still present.
        match self.cas.exists(&artifact.hash).await {
            Ok(true) => Some(artifact),
            _ => None,
        }
    }

    async fn store_with_retry(&self, what: &str, data: &[u8]) -> StorageResult<ContentDigest> {
        let max_attempts = self.config.store_retries + 1;
        let mut attempt = 1;
        loop {
            match self.cas.put(data).await {
                Ok(digest) => return Ok(digest),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.config.backoff(attempt);
                    debug!(what, attempt, error = %e, ?delay, "CAS write failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(what, attempts = attempt, error = %e, "CAS write failed");
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentship_state::fakes::{MemoryArtifactCatalog, MemoryCasStore};

    fn engine() -> (Arc<MemoryCasStore>, BuildEngine) {
        let cas = Arc::new(MemoryCasStore::new());
        let engine = BuildEngine::new(cas.clone(), Arc::new(MemoryArtifactCatalog::new()));
        (cas, engine)
    }

    #[test]
    fn build_key_depends_on_framework() {
        let (_cas, engine) = engine();
        let source = ContentDigest::from_bytes(b"src");
        let a = engine.build_key(&source, &FrameworkProfile::python("langgraph"));
        let b = engine.build_key(&source, &FrameworkProfile::python("crewai"));
        assert_ne!(a, b);
        assert_eq!(
            a,
            engine.build_key(&source, &FrameworkProfile::python("langgraph"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn store_retry_recovers_from_transient_failures() {
        let (cas, engine) = engine();
        cas.fail_next_puts(2);
        let digest = engine.store_with_retry("blob", b"payload").await.unwrap();
        assert_eq!(digest, ContentDigest::from_bytes(b"payload"));
    }

    #[tokio::test(start_paused = true)]
    async fn store_retry_gives_up() {
        let (cas, engine) = engine();
        let engine = engine.with_config(BuildConfig::default().with_store_retries(1));
        cas.fail_next_puts(5);
        assert!(engine.store_with_retry("blob", b"payload").await.is_err());
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let (_cas, engine) = engine();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = engine
            .build(&ContentDigest::from_bytes(b"x"), "custom", &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, BuildError::Cancelled);
    }
}
