//! Framework hint resolution.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// How to run agents written for a framework.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameworkProfile {
    /// Canonical framework name (lowercase).
    pub name: String,

    /// Runtime command prefix (first element is executable).
    pub runtime: Vec<String>,

    /// Entrypoint files tried in order.
    pub entrypoints: Vec<String>,
}

impl FrameworkProfile {
    /// A Python framework with the usual entrypoint candidates.
    pub fn python(name: &str) -> Self {
        Self {
            name: name.to_string(),
            runtime: vec!["python3".to_string(), "-u".to_string()],
            entrypoints: vec![
                "main.py".to_string(),
                "app.py".to_string(),
                "agent.py".to_string(),
            ],
        }
    }
}

/// Maps a caller-supplied hint to a framework profile.
pub trait FrameworkResolver: Send + Sync {
    /// `None` when the hint names no known framework.
    fn resolve(&self, hint: &str) -> Option<FrameworkProfile>;
}

/// Registry of known frameworks, preloaded with the builtin set.
#[derive(Debug, Clone)]
pub struct BuiltinFrameworks {
    profiles: BTreeMap<String, FrameworkProfile>,
}

impl BuiltinFrameworks {
    pub const BUILTIN: &'static [&'static str] =
        &["langgraph", "langchain", "crewai", "autogpt", "custom"];

    pub fn new() -> Self {
        let profiles = Self::BUILTIN
            .iter()
            .map(|name| (name.to_string(), FrameworkProfile::python(name)))
            .collect();
        Self { profiles }
    }

    /// Register (or replace) a framework profile.
    pub fn register(mut self, profile: FrameworkProfile) -> Self {
        self.profiles
            .insert(profile.name.to_ascii_lowercase(), profile);
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }
}

impl Default for BuiltinFrameworks {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameworkResolver for BuiltinFrameworks {
    fn resolve(&self, hint: &str) -> Option<FrameworkProfile> {
        self.profiles
            .get(&hint.trim().to_ascii_lowercase())
            .cloned()
    }
}
