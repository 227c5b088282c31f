//! agentship-build - turns source snapshots into artifacts
//!
//! Provides the build engine that:
//! - Loads a source snapshot from the content-addressed store
//! - Resolves the framework hint through an injected resolver
//! - Reuses cached artifacts for identical (snapshot, framework) inputs
//! - Packages the snapshot under a wall-clock budget, honouring cancellation
//! - Stores the image manifest and build log, then records the artifact

pub mod config;
pub mod engine;
pub mod error;
pub mod framework;
pub mod packager;
pub mod snapshot;

// Re-export key types
pub use config::BuildConfig;
pub use engine::{BuildEngine, BuildOutcome};
pub use error::BuildError;
pub use framework::{BuiltinFrameworks, FrameworkProfile, FrameworkResolver};
pub use packager::{
    BuildCommand, CommandPackager, ImageManifest, ManifestPackager, PackageFailure,
    PackageOutput, PackageRequest, Packager,
};
pub use snapshot::SourceSnapshot;
