//! Configuration for the sync engine.

use std::time::Duration;

/// Configuration for one sync space.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Sync-space identifier (one remote row per space).
    pub space_id: String,
    /// Remote endpoint base URL. Empty means sync is disabled.
    pub endpoint: String,
    /// Remote credentials. Empty means sync is disabled.
    pub api_key: String,
    /// Remote table holding the sync-space rows.
    pub table: String,
    /// Application version, recorded as provenance on pushes.
    pub app_version: String,
    /// Polling interval while the realtime channel is subscribed.
    pub poll_interval: Duration,
    /// Shorter polling interval used while realtime is unavailable.
    pub fallback_poll_interval: Duration,
    /// Cooldown applied to polled pulls after a network failure.
    pub pull_cooldown: Duration,
    /// Consecutive pull network failures before pulling is suspended.
    pub suspend_after: u32,
    /// Retry behavior for push writes.
    pub push_retry: RetryConfig,
    /// Retry behavior for pull reads.
    pub pull_retry: RetryConfig,
    /// Bounded timeout applied to every network call.
    pub call_timeout: Duration,
}

impl SyncConfig {
    /// Creates a configuration with defaults suitable for a foreground
    /// device.
    pub fn new(
        space_id: impl Into<String>,
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            space_id: space_id.into(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            table: "sync_spaces".to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            poll_interval: Duration::from_secs(90),
            fallback_poll_interval: Duration::from_secs(20),
            pull_cooldown: Duration::from_secs(30),
            suspend_after: 3,
            push_retry: RetryConfig::default(),
            pull_retry: RetryConfig::default(),
            call_timeout: Duration::from_secs(10),
        }
    }

    /// Sets the remote table name.
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// Sets the application version recorded on pushes.
    pub fn with_app_version(mut self, version: impl Into<String>) -> Self {
        self.app_version = version.into();
        self
    }

    /// Sets the polling interval used while realtime is subscribed.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the polling interval used while realtime is unavailable.
    pub fn with_fallback_poll_interval(mut self, interval: Duration) -> Self {
        self.fallback_poll_interval = interval;
        self
    }

    /// Sets the pull cooldown after a network failure.
    pub fn with_pull_cooldown(mut self, cooldown: Duration) -> Self {
        self.pull_cooldown = cooldown;
        self
    }

    /// Sets the suspension threshold.
    pub fn with_suspend_after(mut self, failures: u32) -> Self {
        self.suspend_after = failures;
        self
    }

    /// Sets the push retry configuration.
    pub fn with_push_retry(mut self, retry: RetryConfig) -> Self {
        self.push_retry = retry;
        self
    }

    /// Sets the pull retry configuration.
    pub fn with_pull_retry(mut self, retry: RetryConfig) -> Self {
        self.pull_retry = retry;
        self
    }

    /// Sets the per-call timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Returns true when the configuration is complete enough to sync.
    ///
    /// A missing endpoint, credentials, or space id puts the engine in
    /// the disabled state.
    pub fn is_enabled(&self) -> bool {
        !self.space_id.is_empty() && !self.endpoint.is_empty() && !self.api_key.is_empty()
    }
}

/// Bounded retry with linearly increasing delay.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    /// Delay increment between attempts.
    pub base_delay: Duration,
}

impl RetryConfig {
    /// Creates a retry configuration.
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// A configuration that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
        }
    }

    /// Delay before the given attempt (0-indexed). The first attempt
    /// has no delay; each retry waits one increment longer.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500))
    }
}
