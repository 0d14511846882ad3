//! # Constants
//!
//! Shared constants used throughout the controller.
//!
//! These values represent reasonable defaults and can be overridden via
//! configuration or environment variables where applicable.

/// Default HTTP server port for metrics and health probes
pub const DEFAULT_METRICS_PORT: u16 = 5000;

/// Default HTTP server startup timeout (how long to wait for server to be ready)
pub const DEFAULT_SERVER_STARTUP_TIMEOUT_SECS: u64 = 10;

/// Default HTTP server readiness poll interval
pub const DEFAULT_SERVER_POLL_INTERVAL_MS: u64 = 50;

/// Default exponential backoff starting value (milliseconds)
pub const DEFAULT_BACKOFF_START_MS: u64 = 1000;

/// Default exponential backoff maximum value (milliseconds)
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 300_000;

/// Default number of broker-transient failures tolerated for provision, update and bind
pub const DEFAULT_MAX_BROKER_RETRIES: u32 = 10;

/// Default number of catalog misses tolerated before a reference is declared non-existent
pub const DEFAULT_CATALOG_NOT_FOUND_RETRY_LIMIT: u32 = 5;

/// Default first async-operation poll interval (seconds)
pub const DEFAULT_POLL_INTERVAL_START_SECS: u64 = 1;

/// Default cap on the async-operation poll interval (seconds)
pub const DEFAULT_POLL_INTERVAL_MAX_SECS: u64 = 300;

/// Default interval for resyncing converged resources (seconds)
pub const DEFAULT_RESYNC_INTERVAL_SECS: u64 = 300;

/// Default timeout for a single broker HTTP request (seconds)
pub const DEFAULT_BROKER_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Default delay before restarting watch stream after unknown errors (seconds)
pub const DEFAULT_WATCH_RESTART_DELAY_SECS: u64 = 5;

/// Default delay before restarting watch stream after it ends (seconds)
pub const DEFAULT_WATCH_RESTART_DELAY_AFTER_END_SECS: u64 = 1;

/// Default maximum concurrent reconciliations per resource kind
pub const DEFAULT_MAX_CONCURRENT_RECONCILIATIONS: u16 = 10;

/// Default namespace the controller runs in
pub const DEFAULT_CONTROLLER_NAMESPACE: &str = "service-catalog";

/// Default cluster identifier sent to brokers in the request context
pub const DEFAULT_CLUSTER_ID: &str = "service-catalog";

/// Field manager used for server-side apply of binding secrets
pub const FIELD_MANAGER: &str = "service-catalog-controller";
