//! Controller timing configuration.
//!
//! All durations are configurable; defaults suit a local process backend.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Budget for `RuntimeBackend::launch` (milliseconds).
    pub launch_timeout_ms: u64,

    /// Wait between launch and the first health check (milliseconds).
    pub launch_grace_ms: u64,

    /// How long a new deployment must stay healthy before it replaces its
    /// predecessor (milliseconds). Crashes inside the window roll back.
    pub promotion_window_ms: u64,

    /// Health check interval during the promotion window (milliseconds).
    pub health_interval_ms: u64,

    /// Budget for a single health check (milliseconds).
    pub health_timeout_ms: u64,

    /// Interval of the background monitor over promoted deployments (milliseconds).
    pub monitor_interval_ms: u64,

    /// Budget for `RuntimeBackend::terminate` (milliseconds).
    pub teardown_timeout_ms: u64,

    /// Capacity of the live event broadcast channel.
    pub event_buffer: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            launch_timeout_ms: 60_000,
            launch_grace_ms: 1_000,
            promotion_window_ms: 30_000,
            health_interval_ms: 1_000,
            health_timeout_ms: 5_000,
            monitor_interval_ms: 5_000,
            teardown_timeout_ms: 10_000,
            event_buffer: 1024,
        }
    }
}

impl ControllerConfig {
    pub fn with_launch_timeout_ms(mut self, ms: u64) -> Self {
        self.launch_timeout_ms = ms;
        self
    }

    pub fn with_launch_grace_ms(mut self, ms: u64) -> Self {
        self.launch_grace_ms = ms;
        self
    }

    pub fn with_promotion_window_ms(mut self, ms: u64) -> Self {
        self.promotion_window_ms = ms;
        self
    }

    pub fn with_health_interval_ms(mut self, ms: u64) -> Self {
        self.health_interval_ms = ms;
        self
    }

    pub fn with_monitor_interval_ms(mut self, ms: u64) -> Self {
        self.monitor_interval_ms = ms;
        self
    }

    pub fn with_teardown_timeout_ms(mut self, ms: u64) -> Self {
        self.teardown_timeout_ms = ms;
        self
    }

    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity;
        self
    }

    pub fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_timeout_ms)
    }

    pub fn launch_grace(&self) -> Duration {
        Duration::from_millis(self.launch_grace_ms)
    }

    pub fn promotion_window(&self) -> Duration {
        Duration::from_millis(self.promotion_window_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms.max(1))
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms.max(1))
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }

    /// Defaults overridden by `AGENTSHIP_*` environment variables
    ///
    /// Reads:
    /// - AGENTSHIP_LAUNCH_TIMEOUT_MS
    /// - AGENTSHIP_LAUNCH_GRACE_MS
    /// - AGENTSHIP_PROMOTION_WINDOW_MS
    /// - AGENTSHIP_HEALTH_INTERVAL_MS
    /// - AGENTSHIP_HEALTH_TIMEOUT_MS
    /// - AGENTSHIP_MONITOR_INTERVAL_MS
    /// - AGENTSHIP_TEARDOWN_TIMEOUT_MS
    /// - AGENTSHIP_EVENT_BUFFER
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            launch_timeout_ms: env_parse("AGENTSHIP_LAUNCH_TIMEOUT_MS")
                .unwrap_or(d.launch_timeout_ms),
            launch_grace_ms: env_parse("AGENTSHIP_LAUNCH_GRACE_MS").unwrap_or(d.launch_grace_ms),
            promotion_window_ms: env_parse("AGENTSHIP_PROMOTION_WINDOW_MS")
                .unwrap_or(d.promotion_window_ms),
            health_interval_ms: env_parse("AGENTSHIP_HEALTH_INTERVAL_MS")
                .unwrap_or(d.health_interval_ms),
            health_timeout_ms: env_parse("AGENTSHIP_HEALTH_TIMEOUT_MS")
                .unwrap_or(d.health_timeout_ms),
            monitor_interval_ms: env_parse("AGENTSHIP_MONITOR_INTERVAL_MS")
                .unwrap_or(d.monitor_interval_ms),
            teardown_timeout_ms: env_parse("AGENTSHIP_TEARDOWN_TIMEOUT_MS")
                .unwrap_or(d.teardown_timeout_ms),
            event_buffer: env_parse("AGENTSHIP_EVENT_BUFFER").unwrap_or(d.event_buffer),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
