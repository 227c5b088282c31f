//! Source snapshots: the immutable build input of a deployment.
//!
//! A snapshot is a sorted `relative path -> bytes` map. Its canonical
//! encoding is JSON with hex-encoded file contents, so the same tree always
//! hashes to the same digest.

use std::collections::BTreeMap;
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use agentship_state::ContentDigest;

/// Directories never included in a snapshot.
pub const IGNORED_DIRS: &[&str] = &[
    ".git",
    "venv",
    ".venv",
    "env",
    "node_modules",
    "__pycache__",
];

/// Files that describe an agent's dependencies.
pub const DEPENDENCY_FILES: &[&str] = &[
    "requirements.txt",
    "pyproject.toml",
    "Pipfile",
    "setup.py",
    "package.json",
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceSnapshot {
    files: BTreeMap<String, Vec<u8>>,
}

#[derive(Serialize, Deserialize)]
struct Encoded {
    files: BTreeMap<String, String>,
}

impl SourceSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a file. Fails on absolute or parent-escaping paths.
    pub fn insert(&mut self, path: impl Into<String>, content: impl Into<Vec<u8>>) -> Result<(), String> {
        let path = path.into();
        validate_path(&path)?;
        self.files.insert(path, content.into());
        Ok(())
    }

    /// Builder-style `insert` for tests and fixtures.
    pub fn with_file(mut self, path: &str, content: impl Into<Vec<u8>>) -> Result<Self, String> {
        self.insert(path, content)?;
        Ok(self)
    }

    /// Capture every regular file under `root`, skipping [`IGNORED_DIRS`].
    pub fn from_dir(root: &Path) -> std::io::Result<Self> {
        let mut snapshot = Self::new();
        let walker = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| {
                e.depth() == 0
                    || !(e.file_type().is_dir()
                        && e.file_name()
                            .to_str()
                            .map_or(false, |n| IGNORED_DIRS.contains(&n)))
            });

        for entry in walker {
            let entry = entry.map_err(std::io::Error::other)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(root)
                .map_err(std::io::Error::other)?;
            let key = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            let content = std::fs::read(entry.path())?;
            snapshot.files.insert(key, content);
        }
        Ok(snapshot)
    }

    /// Canonical encoding.
    pub fn to_bytes(&self) -> Vec<u8> {
        let encoded = Encoded {
            files: self
                .files
                .iter()
                .map(|(k, v)| (k.clone(), hex::encode(v)))
                .collect(),
        };
        // A map of strings always serializes.
        serde_json::to_vec(&encoded).unwrap_or_default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, String> {
        let encoded: Encoded =
            serde_json::from_slice(bytes).map_err(|e| format!("malformed snapshot: {e}"))?;
        let mut snapshot = Self::new();
        for (path, content) in encoded.files {
            let bytes =
                hex::decode(&content).map_err(|e| format!("malformed content for {path}: {e}"))?;
            snapshot.insert(path, bytes)?;
        }
        Ok(snapshot)
    }

    pub fn digest(&self) -> ContentDigest {
        ContentDigest::from_bytes(&self.to_bytes())
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    pub fn get(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(Vec::as_slice)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Dependency manifests present at the snapshot root.
    pub fn dependency_files(&self) -> Vec<String> {
        DEPENDENCY_FILES
            .iter()
            .filter(|f| self.contains(f))
            .map(|f| f.to_string())
            .collect()
    }

    /// Write the snapshot out under `dest`.
    pub fn materialize(&self, dest: &Path) -> std::io::Result<()> {
        for (path, content) in &self.files {
            let target = dest.join(path);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(target, content)?;
        }
        Ok(())
    }
}

fn validate_path(path: &str) -> Result<(), String> {
    let p = Path::new(path);
    if path.is_empty() || p.is_absolute() {
        return Err(format!("invalid snapshot path: {path:?}"));
    }
    if p.components().any(|c| !matches!(c, Component::Normal(_))) {
        return Err(format!("snapshot path escapes root: {path:?}"));
    }
    Ok(())
}
