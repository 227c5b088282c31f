//! Build engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Limits and retry policy for builds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Wall-clock budget for packaging (seconds).
    pub timeout_secs: u64,

    /// Retries for CAS writes of the manifest and log (0 = single attempt).
    pub store_retries: u32,

    /// Base delay for exponential backoff between CAS retries (milliseconds).
    pub backoff_base_ms: u64,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 600,
            store_retries: 3,
            backoff_base_ms: 200,
        }
    }
}

impl BuildConfig {
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_store_retries(mut self, retries: u32) -> Self {
        self.store_retries = retries;
        self
    }

    pub fn with_backoff_base_ms(mut self, ms: u64) -> Self {
        self.backoff_base_ms = ms;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Delay before retry `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_base_ms * 2u64.pow(attempt.saturating_sub(1)))
    }

    /// Defaults overridden by environment variables
    ///
    /// Reads:
    /// - AGENTSHIP_BUILD_TIMEOUT_SECS
    /// - AGENTSHIP_BUILD_STORE_RETRIES
    /// - AGENTSHIP_BUILD_BACKOFF_MS
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            timeout_secs: env_parse("AGENTSHIP_BUILD_TIMEOUT_SECS")
                .unwrap_or(defaults.timeout_secs),
            store_retries: env_parse("AGENTSHIP_BUILD_STORE_RETRIES")
                .unwrap_or(defaults.store_retries),
            backoff_base_ms: env_parse("AGENTSHIP_BUILD_BACKOFF_MS")
                .unwrap_or(defaults.backoff_base_ms),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
