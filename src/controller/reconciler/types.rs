//! # Reconciler Types
//!
//! Shared context, per-resource retry bookkeeping and the error type returned to
//! the error policy.

use crate::broker::{BrokerRegistry, BrokerError};
use crate::catalog::{CatalogError, CatalogLookup};
use crate::config::ControllerConfig;
use crate::controller::backoff::ExponentialBackoff;
use crate::store::{InstanceLookup, SecretStore, StoreError};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcilerError {
    #[error("Catalog unavailable: {0}")]
    Catalog(#[from] CatalogError),
    #[error("Store operation failed: {0}")]
    Store(#[from] StoreError),
    #[error("Broker client unavailable: {0}")]
    Broker(#[from] BrokerError),
    #[error("Resource is missing {0}")]
    MissingMetadata(&'static str),
    #[error("Status write conflicted with a newer version of {0}")]
    Conflict(String),
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

/// What caused a reconciliation to be scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    /// An operation was written to status and must now be issued
    OperationRecorded,
    /// An asynchronous broker operation is being polled
    AsyncPoll,
    /// A retriable failure is being retried
    ErrorBackoff,
    /// A referenced object (instance, catalog entry, broker) is not available yet
    WaitingForResource,
    /// Periodic resync of a converged resource
    Resync,
}

impl TriggerSource {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::OperationRecorded => "operation-recorded",
            TriggerSource::AsyncPoll => "async-poll",
            TriggerSource::ErrorBackoff => "error-backoff",
            TriggerSource::WaitingForResource => "waiting-for-resource",
            TriggerSource::Resync => "resync",
        }
    }
}

/// Retry bookkeeping for one resource
///
/// Reset whenever the resource's generation changes.
#[derive(Debug, Clone)]
pub struct BackoffState {
    pub backoff: ExponentialBackoff,
    pub error_count: u32,
    pub poll: ExponentialBackoff,
    pub poll_count: u32,
    pub catalog_misses: u32,
    pub generation: i64,
}

impl BackoffState {
    #[must_use]
    pub fn new(config: &ControllerConfig, generation: i64) -> Self {
        Self {
            backoff: ExponentialBackoff::new(
                config.backoff_start_duration(),
                config.backoff_max_duration(),
            ),
            error_count: 0,
            poll: ExponentialBackoff::new(
                config.poll_interval_start_duration(),
                config.poll_interval_max_duration(),
            ),
            poll_count: 0,
            catalog_misses: 0,
            generation,
        }
    }

    /// Count a failure and return the delay before the next attempt
    pub fn record_error(&mut self) -> Duration {
        self.error_count += 1;
        self.backoff.next_backoff()
    }

    /// Count a poll and return the delay before the next one
    pub fn next_poll(&mut self) -> Duration {
        self.poll_count += 1;
        self.poll.next_backoff()
    }

    pub fn reset_poll(&mut self) {
        self.poll_count = 0;
        self.poll.reset();
    }

    pub fn reset(&mut self) {
        self.error_count = 0;
        self.catalog_misses = 0;
        self.backoff.reset();
        self.reset_poll();
    }
}

/// Context shared by every reconciliation
#[derive(Clone)]
pub struct Reconciler {
    pub catalog: Arc<dyn CatalogLookup>,
    pub brokers: Arc<dyn BrokerRegistry>,
    pub secrets: Arc<dyn SecretStore>,
    pub instances: Arc<dyn InstanceLookup>,
    pub config: ControllerConfig,
    // Keyed by "<kind>/<namespace>/<name>"
    pub backoff_states: Arc<Mutex<HashMap<String, BackoffState>>>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    #[must_use]
    pub fn new(
        catalog: Arc<dyn CatalogLookup>,
        brokers: Arc<dyn BrokerRegistry>,
        secrets: Arc<dyn SecretStore>,
        instances: Arc<dyn InstanceLookup>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            catalog,
            brokers,
            secrets,
            instances,
            config,
            backoff_states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    #[must_use]
    pub fn backoff_key(kind: &str, namespace: &str, name: &str) -> String {
        format!("{kind}/{namespace}/{name}")
    }

    /// Run `f` against a resource's retry state, resetting it on a generation change
    pub fn with_backoff<R>(
        &self,
        key: &str,
        generation: i64,
        f: impl FnOnce(&mut BackoffState) -> R,
    ) -> R {
        let mut states = self
            .backoff_states
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let state = states
            .entry(key.to_string())
            .or_insert_with(|| BackoffState::new(&self.config, generation));
        if state.generation != generation {
            state.reset();
            state.generation = generation;
        }
        f(state)
    }

    /// Drop a resource's retry state once it is gone
    pub fn forget(&self, key: &str) {
        self.backoff_states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    /// Platform context sent with instance and binding requests
    #[must_use]
    pub fn request_context(&self, namespace: &str) -> Value {
        json!({
            "platform": "kubernetes",
            "namespace": namespace,
            "clusterid": self.config.cluster_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::StaticBrokerRegistry;
    use crate::catalog::CatalogSnapshot;
    use crate::store::{InMemoryInstanceStore, InMemorySecretStore};

    fn reconciler() -> Reconciler {
        Reconciler::new(
            Arc::new(CatalogSnapshot::new()),
            Arc::new(StaticBrokerRegistry::default()),
            Arc::new(InMemorySecretStore::new()),
            Arc::new(InMemoryInstanceStore::new()),
            ControllerConfig::default(),
        )
    }

    #[test]
    fn test_backoff_state_resets_on_generation_change() {
        let ctx = reconciler();
        let key = Reconciler::backoff_key("instance", "ns", "db");

        let first = ctx.with_backoff(&key, 1, BackoffState::record_error);
        let second = ctx.with_backoff(&key, 1, BackoffState::record_error);
        assert!(second > first);
        assert_eq!(ctx.with_backoff(&key, 1, |s| s.error_count), 2);

        assert_eq!(ctx.with_backoff(&key, 2, |s| s.error_count), 0);
        let after_reset = ctx.with_backoff(&key, 2, BackoffState::record_error);
        assert_eq!(after_reset, first);

        ctx.forget(&key);
        assert!(ctx
            .backoff_states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty());
    }

    #[test]
    fn test_request_context_names_namespace_and_cluster() {
        let ctx = reconciler();
        let context = ctx.request_context("team-a");
        assert_eq!(context["platform"], "kubernetes");
        assert_eq!(context["namespace"], "team-a");
        assert_eq!(context["clusterid"], ctx.config.cluster_id.as_str());
    }

    #[test]
    fn test_trigger_source_labels() {
        assert_eq!(TriggerSource::AsyncPoll.as_str(), "async-poll");
        assert_eq!(TriggerSource::ErrorBackoff.as_str(), "error-backoff");
        assert_eq!(TriggerSource::Resync.as_str(), "resync");
    }
}
