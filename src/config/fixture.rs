//! # Fixture Configuration
//!
//! Settings loaded from environment variables.

use crate::backoff::ExponentialBackoff;
use crate::expose::ExposeMode;
use std::time::Duration;

/// Fixture-level configuration
///
/// All settings have sensible defaults and can be overridden via environment variables.
#[derive(Debug, Clone)]
pub struct FixtureConfig {
    /// Namespace used when a manifest does not name one
    pub namespace: String,
    /// Kubeconfig context to connect with (None = current context or in-cluster)
    pub context: Option<String>,
    /// Timeout for a single cluster API operation (seconds)
    pub operation_timeout_secs: u64,
    /// Readiness budget per resource when the resource sets none (seconds)
    pub readiness_timeout_secs: u64,
    /// Readiness poll interval (milliseconds), clamped to 500..=2000
    pub poll_interval_ms: u64,
    /// Upper bound of the random jitter added to each poll (milliseconds)
    pub poll_jitter_ms: u64,
    /// Attempts for transient create failures
    pub max_retry_attempts: u32,
    /// Exponential backoff starting value (milliseconds)
    pub backoff_base_ms: u64,
    /// Exponential backoff maximum value (milliseconds)
    pub backoff_max_ms: u64,
    /// Attempts when probing a tunnel's remote port
    pub expose_retry_attempts: u32,
    /// Attempts per delete during teardown
    pub teardown_retry_attempts: u32,
    /// Lifetime after which the cluster-side fallback may reclaim a scope (seconds)
    pub fallback_ttl_secs: u64,
    /// Image pull secrets added to every pod
    pub pull_secrets: Vec<String>,
    /// Image run by scope anchor Jobs
    pub anchor_image: String,
    /// How exposure plans reach ports unless an entry says otherwise
    pub expose_mode: ExposeMode,
    /// Address dialed for node ports instead of the pod's `hostIP`
    pub node_address: Option<String>,
    /// Global log level (ERROR, WARN, INFO, DEBUG, TRACE)
    pub log_level: String,
    /// Log format (json, text)
    pub log_format: String,
}

impl Default for FixtureConfig {
    fn default() -> Self {
        use crate::constants::*;
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            context: None,
            operation_timeout_secs: DEFAULT_OPERATION_TIMEOUT_SECS,
            readiness_timeout_secs: DEFAULT_READINESS_TIMEOUT_SECS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            poll_jitter_ms: DEFAULT_POLL_JITTER_MS,
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            expose_retry_attempts: DEFAULT_EXPOSE_RETRY_ATTEMPTS,
            teardown_retry_attempts: DEFAULT_TEARDOWN_RETRY_ATTEMPTS,
            fallback_ttl_secs: DEFAULT_FALLBACK_TTL_SECS,
            pull_secrets: Vec::new(),
            anchor_image: DEFAULT_ANCHOR_IMAGE.to_string(),
            expose_mode: ExposeMode::PortForward,
            node_address: None,
            log_level: "INFO".to_string(),
            log_format: "text".to_string(),
        }
    }
}

impl FixtureConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        use crate::constants::*;
        Self {
            namespace: env_var_or_default_str("KUBE_FIXTURES_NAMESPACE", DEFAULT_NAMESPACE),
            context: std::env::var("KUBE_FIXTURES_CONTEXT")
                .ok()
                .filter(|c| !c.trim().is_empty()),
            operation_timeout_secs: env_var_or_default(
                "KUBE_FIXTURES_OPERATION_TIMEOUT_SECS",
                DEFAULT_OPERATION_TIMEOUT_SECS,
            ),
            readiness_timeout_secs: env_var_or_default(
                "KUBE_FIXTURES_READINESS_TIMEOUT_SECS",
                DEFAULT_READINESS_TIMEOUT_SECS,
            ),
            poll_interval_ms: env_var_or_default(
                "KUBE_FIXTURES_POLL_INTERVAL_MS",
                DEFAULT_POLL_INTERVAL_MS,
            ),
            poll_jitter_ms: env_var_or_default("KUBE_FIXTURES_POLL_JITTER_MS", DEFAULT_POLL_JITTER_MS),
            max_retry_attempts: env_var_or_default(
                "KUBE_FIXTURES_MAX_RETRY_ATTEMPTS",
                DEFAULT_MAX_RETRY_ATTEMPTS,
            ),
            backoff_base_ms: env_var_or_default("KUBE_FIXTURES_BACKOFF_BASE_MS", DEFAULT_BACKOFF_BASE_MS),
            backoff_max_ms: env_var_or_default("KUBE_FIXTURES_BACKOFF_MAX_MS", DEFAULT_BACKOFF_MAX_MS),
            expose_retry_attempts: env_var_or_default(
                "KUBE_FIXTURES_EXPOSE_RETRY_ATTEMPTS",
                DEFAULT_EXPOSE_RETRY_ATTEMPTS,
            ),
            teardown_retry_attempts: env_var_or_default(
                "KUBE_FIXTURES_TEARDOWN_RETRY_ATTEMPTS",
                DEFAULT_TEARDOWN_RETRY_ATTEMPTS,
            ),
            fallback_ttl_secs: env_var_or_default(
                "KUBE_FIXTURES_FALLBACK_TTL_SECS",
                DEFAULT_FALLBACK_TTL_SECS,
            ),
            pull_secrets: env_var_list("KUBE_FIXTURES_PULL_SECRETS"),
            anchor_image: env_var_or_default_str("KUBE_FIXTURES_ANCHOR_IMAGE", DEFAULT_ANCHOR_IMAGE),
            expose_mode: env_var_or_default("KUBE_FIXTURES_EXPOSE_MODE", ExposeMode::PortForward),
            node_address: std::env::var("KUBE_FIXTURES_NODE_ADDRESS")
                .ok()
                .filter(|a| !a.trim().is_empty()),
            log_level: env_var_or_default_str("KUBE_FIXTURES_LOG_LEVEL", "INFO"),
            log_format: env_var_or_default_str("KUBE_FIXTURES_LOG_FORMAT", "text"),
        }
    }

    /// Get the per-operation timeout
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    /// Get the default readiness budget
    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    /// Get the poll interval, clamped to the supported range
    pub fn poll_interval(&self) -> Duration {
        use crate::constants::{MAX_POLL_INTERVAL_MS, MIN_POLL_INTERVAL_MS};
        Duration::from_millis(
            self.poll_interval_ms
                .clamp(MIN_POLL_INTERVAL_MS, MAX_POLL_INTERVAL_MS),
        )
    }

    /// Get the poll jitter bound
    pub fn poll_jitter(&self) -> Duration {
        Duration::from_millis(self.poll_jitter_ms)
    }

    /// Get the fallback TTL
    pub fn fallback_ttl(&self) -> Duration {
        Duration::from_secs(self.fallback_ttl_secs)
    }

    /// Retry policy for resource creation
    pub fn create_retry(&self) -> RetryPolicy {
        self.retry_policy(self.max_retry_attempts)
    }

    /// Retry policy for tunnel setup
    pub fn expose_retry(&self) -> RetryPolicy {
        self.retry_policy(self.expose_retry_attempts)
    }

    /// Retry policy for deletes during teardown
    pub fn teardown_retry(&self) -> RetryPolicy {
        self.retry_policy(self.teardown_retry_attempts)
    }

    fn retry_policy(&self, max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            base: Duration::from_millis(self.backoff_base_ms),
            cap: Duration::from_millis(self.backoff_max_ms.max(self.backoff_base_ms)),
        }
    }
}

/// Bounded retry settings shared by provisioning, exposure and teardown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// First backoff delay
    pub base: Duration,
    /// Largest backoff delay
    pub cap: Duration,
}

impl RetryPolicy {
    /// Fresh backoff sequence for one retried operation
    #[must_use]
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.base, self.cap)
    }
}

/// Read environment variable or return default value
fn env_var_or_default<T: std::str::FromStr>(key: &str, default: T) -> T
where
    <T as std::str::FromStr>::Err: std::fmt::Debug,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Read environment variable as string or return default
fn env_var_or_default_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Read a comma separated environment variable, dropping blanks
fn env_var_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default()
}
