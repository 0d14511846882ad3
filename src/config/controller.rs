//! # Controller Configuration
//!
//! Controller-level settings loaded from environment variables.

use std::time::Duration;

/// Reconciliation, retry and polling settings
///
/// Every field falls back to a constant from [`crate::constants`] when its
/// environment variable is unset or unparsable. The deployment injects the
/// variables from the controller ConfigMap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// First delay after a broker-transient failure or a catalog miss (milliseconds)
    pub backoff_start_ms: u64,
    /// Ceiling for the retry delay (milliseconds)
    pub backoff_max_ms: u64,
    /// Broker-transient failures tolerated for provision, update and bind
    /// before the resource is marked Failed
    pub max_broker_retries: u32,
    /// Catalog misses tolerated before a class or plan reference is declared non-existent
    pub catalog_not_found_retry_limit: u32,
    /// First async-operation poll interval (seconds); doubles on every poll
    pub poll_interval_start_secs: u64,
    /// Cap on the async-operation poll interval (seconds)
    pub poll_interval_max_secs: u64,
    /// Resync interval for converged resources (seconds)
    pub resync_interval_secs: u64,
    /// Timeout for a single broker HTTP request (seconds)
    pub broker_request_timeout_secs: u64,
    /// Send `accepts_incomplete=true` on bind and unbind
    pub async_binding_operations: bool,
    /// Pause before re-opening a watch that failed with an unclassified error (seconds)
    pub watch_restart_delay_secs: u64,
    /// Pause before re-opening a watch whose stream ended cleanly (seconds)
    pub watch_restart_delay_after_end_secs: u64,
    /// Namespace the controller runs in, from `POD_NAMESPACE`
    pub controller_namespace: String,
    /// Cluster identifier sent to brokers as `organization_guid` and `context.clusterid`
    pub cluster_id: String,
    /// `json` or `text`
    pub log_format: String,
    /// Maximum concurrent reconciliations per resource kind
    pub max_concurrent_reconciliations: u16,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        use crate::constants::*;
        Self {
            backoff_start_ms: DEFAULT_BACKOFF_START_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            max_broker_retries: DEFAULT_MAX_BROKER_RETRIES,
            catalog_not_found_retry_limit: DEFAULT_CATALOG_NOT_FOUND_RETRY_LIMIT,
            poll_interval_start_secs: DEFAULT_POLL_INTERVAL_START_SECS,
            poll_interval_max_secs: DEFAULT_POLL_INTERVAL_MAX_SECS,
            resync_interval_secs: DEFAULT_RESYNC_INTERVAL_SECS,
            broker_request_timeout_secs: DEFAULT_BROKER_REQUEST_TIMEOUT_SECS,
            async_binding_operations: false,
            watch_restart_delay_secs: DEFAULT_WATCH_RESTART_DELAY_SECS,
            watch_restart_delay_after_end_secs: DEFAULT_WATCH_RESTART_DELAY_AFTER_END_SECS,
            controller_namespace: DEFAULT_CONTROLLER_NAMESPACE.to_string(),
            cluster_id: DEFAULT_CLUSTER_ID.to_string(),
            log_format: "json".to_string(),
            max_concurrent_reconciliations: DEFAULT_MAX_CONCURRENT_RECONCILIATIONS,
        }
    }
}

impl ControllerConfig {
    /// Read every setting from the process environment
    #[must_use]
    pub fn from_env() -> Self {
        use crate::constants::*;
        Self {
            backoff_start_ms: parsed_from_env("BACKOFF_START_MS", DEFAULT_BACKOFF_START_MS),
            backoff_max_ms: parsed_from_env("BACKOFF_MAX_MS", DEFAULT_BACKOFF_MAX_MS),
            max_broker_retries: parsed_from_env(
                "MAX_BROKER_RETRIES",
                DEFAULT_MAX_BROKER_RETRIES,
            ),
            catalog_not_found_retry_limit: parsed_from_env(
                "CATALOG_NOT_FOUND_RETRY_LIMIT",
                DEFAULT_CATALOG_NOT_FOUND_RETRY_LIMIT,
            ),
            poll_interval_start_secs: parsed_from_env(
                "POLL_INTERVAL_START_SECS",
                DEFAULT_POLL_INTERVAL_START_SECS,
            ),
            poll_interval_max_secs: parsed_from_env(
                "POLL_INTERVAL_MAX_SECS",
                DEFAULT_POLL_INTERVAL_MAX_SECS,
            ),
            resync_interval_secs: parsed_from_env(
                "RESYNC_INTERVAL_SECS",
                DEFAULT_RESYNC_INTERVAL_SECS,
            ),
            broker_request_timeout_secs: parsed_from_env(
                "BROKER_REQUEST_TIMEOUT_SECS",
                DEFAULT_BROKER_REQUEST_TIMEOUT_SECS,
            ),
            async_binding_operations: flag_from_env("ASYNC_BINDING_OPERATIONS", false),
            watch_restart_delay_secs: parsed_from_env(
                "WATCH_RESTART_DELAY_SECS",
                DEFAULT_WATCH_RESTART_DELAY_SECS,
            ),
            watch_restart_delay_after_end_secs: parsed_from_env(
                "WATCH_RESTART_DELAY_AFTER_END_SECS",
                DEFAULT_WATCH_RESTART_DELAY_AFTER_END_SECS,
            ),
            controller_namespace: string_from_env(
                "POD_NAMESPACE",
                DEFAULT_CONTROLLER_NAMESPACE,
            ),
            cluster_id: string_from_env("CLUSTER_ID", DEFAULT_CLUSTER_ID),
            log_format: string_from_env("LOG_FORMAT", "json"),
            max_concurrent_reconciliations: parsed_from_env(
                "MAX_CONCURRENT_RECONCILIATIONS",
                DEFAULT_MAX_CONCURRENT_RECONCILIATIONS,
            ),
        }
    }

    /// Delay before the first retry
    #[must_use]
    pub fn backoff_start_duration(&self) -> Duration {
        Duration::from_millis(self.backoff_start_ms)
    }

    #[must_use]
    pub fn backoff_max_duration(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    #[must_use]
    pub fn poll_interval_start_duration(&self) -> Duration {
        Duration::from_secs(self.poll_interval_start_secs)
    }

    #[must_use]
    pub fn poll_interval_max_duration(&self) -> Duration {
        Duration::from_secs(self.poll_interval_max_secs)
    }

    #[must_use]
    pub fn resync_interval_duration(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    #[must_use]
    pub fn broker_request_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.broker_request_timeout_secs)
    }

    #[must_use]
    pub fn watch_restart_delay_duration(&self) -> Duration {
        Duration::from_secs(self.watch_restart_delay_secs)
    }

    #[must_use]
    pub fn watch_restart_delay_after_end_duration(&self) -> Duration {
        Duration::from_secs(self.watch_restart_delay_after_end_secs)
    }
}

/// Parse `key` from the environment, keeping `default` when it is unset or malformed
pub(crate) fn parsed_from_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}

/// Accepts `true`/`1`/`yes`/`on` in any case; any other value reads as false
pub(crate) fn flag_from_env(key: &str, default: bool) -> bool {
    std::env::var(key).map_or(default, |raw| {
        matches!(
            raw.trim().to_ascii_lowercase().as_str(),
            "true" | "1" | "yes" | "on"
        )
    })
}

pub(crate) fn string_from_env(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_durations() {
        let config = ControllerConfig::default();
        assert_eq!(config.backoff_start_duration(), Duration::from_secs(1));
        assert_eq!(config.backoff_max_duration(), Duration::from_secs(300));
        assert_eq!(config.poll_interval_start_duration(), Duration::from_secs(1));
        assert_eq!(config.poll_interval_max_duration(), Duration::from_secs(300));
        assert!(!config.async_binding_operations);
    }

    #[test]
    fn test_unset_variables_keep_defaults() {
        assert_eq!(
            parsed_from_env("SERVICE_CATALOG_TEST_UNSET_NUMBER", 7u32),
            7
        );
        assert!(flag_from_env(
            "SERVICE_CATALOG_TEST_UNSET_BOOL",
            true
        ));
        assert_eq!(
            string_from_env("SERVICE_CATALOG_TEST_UNSET_STR", "fallback"),
            "fallback"
        );
    }
}
