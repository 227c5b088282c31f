//! Integration tests for the build engine with in-memory stores.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use agentship_build::{
    BuildConfig, BuildEngine, BuildError, ImageManifest, ManifestPackager, PackageFailure,
    PackageOutput, PackageRequest, Packager, SourceSnapshot,
};
use agentship_state::fakes::{MemoryArtifactCatalog, MemoryCasStore};
use agentship_state::{ArtifactCatalog, CasStore, ContentDigest};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

fn stores() -> (Arc<MemoryCasStore>, Arc<MemoryArtifactCatalog>) {
    (
        Arc::new(MemoryCasStore::new()),
        Arc::new(MemoryArtifactCatalog::new()),
    )
}

fn snapshot() -> SourceSnapshot {
    SourceSnapshot::new()
        .with_file("main.py", "print('weather bot')")
        .unwrap()
        .with_file("requirements.txt", "langgraph==0.2\n")
        .unwrap()
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

/// Packages normally but cancels the build on the way out.
struct CancellingPackager {
    cancel: CancellationToken,
}

#[async_trait]
impl Packager for CancellingPackager {
    fn fingerprint(&self) -> String {
        "cancel".into()
    }

    async fn package(&self, request: &PackageRequest) -> Result<PackageOutput, PackageFailure> {
        let output = ManifestPackager.package(request).await;
        self.cancel.cancel();
        output
    }
}

/// Counts packaging runs, always fails.
#[derive(Default)]
struct FailingPackager {
    runs: AtomicU32,
}

#[async_trait]
impl Packager for FailingPackager {
    fn fingerprint(&self) -> String {
        "fail".into()
    }

    async fn package(&self, _request: &PackageRequest) -> Result<PackageOutput, PackageFailure> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Err(PackageFailure {
            reason: "pip install failed".into(),
            log: "ERROR: no matching distribution".into(),
        })
    }
}

#[tokio::test]
async fn identical_sources_share_an_artifact() {
    let (cas, catalog) = stores();
    let engine = BuildEngine::new(cas.clone(), catalog.clone());
    let cancel = CancellationToken::new();

    let s1 = engine.submit_snapshot(&snapshot()).await.unwrap();
    let s2 = engine.submit_snapshot(&snapshot()).await.unwrap();
    assert_eq!(s1, s2);

    let first = engine.build(&s1, "langgraph", &cancel).await.unwrap();
    assert!(!first.cached);
    let second = engine.build(&s2, "LangGraph", &cancel).await.unwrap();
    assert!(second.cached);
    assert_eq!(first.artifact.hash, second.artifact.hash);

    let manifest = ImageManifest::from_bytes(&cas.get(&first.artifact.hash).await.unwrap()).unwrap();
    assert_eq!(manifest.entrypoint, "main.py");
    assert_eq!(manifest.source, s1);
    assert_eq!(manifest.framework, "langgraph");

    let log = cas.get(&first.artifact.build_log).await.unwrap();
    assert!(String::from_utf8(log).unwrap().contains("entrypoint: main.py"));
    assert_eq!(catalog.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn deterministic_without_cache() {
    let (cas_a, catalog_a) = stores();
    let (cas_b, catalog_b) = stores();
    let a = BuildEngine::new(cas_a, catalog_a);
    let b = BuildEngine::new(cas_b, catalog_b);
    let cancel = CancellationToken::new();

    let sa = a.submit_snapshot(&snapshot()).await.unwrap();
    let sb = b.submit_snapshot(&snapshot()).await.unwrap();
    let ha = a.build(&sa, "custom", &cancel).await.unwrap().artifact.hash;
    let hb = b.build(&sb, "custom", &cancel).await.unwrap().artifact.hash;
    assert_eq!(ha, hb);
}

#[tokio::test]
async fn missing_snapshot_is_invalid_source() {
    let (cas, catalog) = stores();
    let engine = BuildEngine::new(cas, catalog);
    let err = engine
        .build(
            &ContentDigest::from_bytes(b"never stored"),
            "custom",
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "InvalidSource");
}

#[tokio::test]
async fn garbage_snapshot_is_invalid_source() {
    let (cas, catalog) = stores();
    let digest = cas.put(b"definitely not a snapshot").await.unwrap();
    let engine = BuildEngine::new(cas, catalog);
    let err = engine
        .build(&digest, "custom", &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, BuildError::InvalidSource { .. }));
}

#[tokio::test]
async fn unknown_framework_is_rejected() {
    let (cas, catalog) = stores();
    let engine = BuildEngine::new(cas, catalog);
    let source = engine.submit_snapshot(&snapshot()).await.unwrap();
    let err = engine
        .build(&source, "semantic-kernel", &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        BuildError::UnsupportedFramework {
            hint: "semantic-kernel".into()
        }
    );
}

#[tokio::test(start_paused = true)]
async fn hung_build_times_out_without_artifact() {
    let (cas, catalog) = stores();
    let engine = BuildEngine::new(cas, catalog.clone())
        .with_packager(Arc::new(HangingPackager))
        .with_config(BuildConfig::default().with_timeout_secs(30));
    let source = engine.submit_snapshot(&snapshot()).await.unwrap();

    let err = engine
        .build(&source, "custom", &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err, BuildError::BuildTimeout { limit_secs: 30 });
    assert!(catalog.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn cancellation_interrupts_packaging() {
    let (cas, catalog) = stores();
    let engine = BuildEngine::new(cas, catalog.clone()).with_packager(Arc::new(HangingPackager));
    let source = engine.submit_snapshot(&snapshot()).await.unwrap();
    let cancel = CancellationToken::new();

    let task = {
        let engine = engine.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { engine.build(&source, "custom", &cancel).await })
    };
    tokio::task::yield_now().await;
    cancel.cancel();

    let err = task.await.unwrap().unwrap_err();
    assert_eq!(err, BuildError::Cancelled);
    assert!(catalog.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn cancellation_after_packaging_stores_nothing() {
    let (cas, catalog) = stores();
    let cancel = CancellationToken::new();
    let engine = BuildEngine::new(cas.clone(), catalog.clone()).with_packager(Arc::new(
        CancellingPackager {
            cancel: cancel.clone(),
        },
    ));
    let source = engine.submit_snapshot(&snapshot()).await.unwrap();
    let blobs_before = cas.len();

    let err = engine.build(&source, "langgraph", &cancel).await.unwrap_err();
    assert_eq!(err, BuildError::Cancelled);
    assert_eq!(cas.len(), blobs_before);
    assert!(catalog.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_build_keeps_log_and_is_not_retried() {
    let (cas, catalog) = stores();
    let packager = Arc::new(FailingPackager::default());
    let engine = BuildEngine::new(cas.clone(), catalog).with_packager(packager.clone());
    let source = engine.submit_snapshot(&snapshot()).await.unwrap();

    let err = engine
        .build(&source, "custom", &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "BuildFailed");
    assert_eq!(packager.runs.load(Ordering::SeqCst), 1);

    let log_ref = err.log_ref().unwrap();
    let log = String::from_utf8(cas.get(log_ref).await.unwrap()).unwrap();
    assert!(log.contains("no matching distribution"));
}

#[tokio::test(start_paused = true)]
async fn exhausted_store_retries_fail_the_build() {
    let (cas, catalog) = stores();
    let engine = BuildEngine::new(cas.clone(), catalog.clone())
        .with_config(BuildConfig::default().with_store_retries(2));
    let source = engine.submit_snapshot(&snapshot()).await.unwrap();

    cas.fail_next_puts(3);
    let err = engine
        .build(&source, "custom", &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "BuildFailed");
    assert!(catalog.list().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn transient_store_failures_are_retried() {
    let (cas, catalog) = stores();
    let engine = BuildEngine::new(cas.clone(), catalog);
    let source = engine.submit_snapshot(&snapshot()).await.unwrap();

    cas.fail_next_puts(2);
    let outcome = engine
        .build(&source, "custom", &CancellationToken::new())
        .await
        .unwrap();
    assert!(cas.exists(&outcome.artifact.hash).await.unwrap());
}
