//! # Metrics
//!
//! Prometheus metrics for monitoring the controller.
//!
//! ## Metrics Exposed
//!
//! - `service_catalog_reconciliations_total{kind}` - Reconciliations by resource kind
//! - `service_catalog_reconciliation_errors_total{kind}` - Reconciliations that returned an error
//! - `service_catalog_reconciliation_duration_seconds{kind}` - Duration of reconciliation passes
//! - `service_catalog_broker_requests_total{operation,outcome}` - Broker requests by outcome
//! - `service_catalog_broker_request_duration_seconds{operation}` - Broker request latency
//! - `service_catalog_requeues_total{trigger}` - Requeues by trigger source
//! - `service_catalog_async_polls_total{kind,state}` - Last-operation polls by reported state
//! - `service_catalog_secrets_injected_total` - Binding secrets written
//! - `service_catalog_orphan_mitigations_total{kind}` - Orphan mitigations started

use anyhow::Result;
use prometheus::{HistogramVec, IntCounter, IntCounterVec, Registry};
use std::sync::LazyLock;

// Metrics
pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILIATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "service_catalog_reconciliations_total",
            "Total number of reconciliations by resource kind",
        ),
        &["kind"],
    )
    .expect("Failed to create RECONCILIATIONS_TOTAL metric - this should never happen")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "service_catalog_reconciliation_errors_total",
            "Total number of reconciliation errors by resource kind",
        ),
        &["kind"],
    )
    .expect("Failed to create RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static RECONCILIATION_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        prometheus::HistogramOpts::new(
            "service_catalog_reconciliation_duration_seconds",
            "Duration of reconciliation in seconds by resource kind",
        )
        .buckets(vec![0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
        &["kind"],
    )
    .expect("Failed to create RECONCILIATION_DURATION metric - this should never happen")
});

static BROKER_REQUESTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "service_catalog_broker_requests_total",
            "Total number of broker requests by operation and outcome",
        ),
        &["operation", "outcome"],
    )
    .expect("Failed to create BROKER_REQUESTS_TOTAL metric - this should never happen")
});

static BROKER_REQUEST_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        prometheus::HistogramOpts::new(
            "service_catalog_broker_request_duration_seconds",
            "Duration of broker requests in seconds by operation",
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]),
        &["operation"],
    )
    .expect("Failed to create BROKER_REQUEST_DURATION metric - this should never happen")
});

static REQUEUES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "service_catalog_requeues_total",
            "Total number of requeues by trigger source",
        ),
        &["trigger"],
    )
    .expect("Failed to create REQUEUES_TOTAL metric - this should never happen")
});

static ASYNC_POLLS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "service_catalog_async_polls_total",
            "Total number of last-operation polls by resource kind and reported state",
        ),
        &["kind", "state"],
    )
    .expect("Failed to create ASYNC_POLLS_TOTAL metric - this should never happen")
});

static SECRETS_INJECTED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "service_catalog_secrets_injected_total",
        "Total number of binding credential secrets written",
    )
    .expect("Failed to create SECRETS_INJECTED_TOTAL metric - this should never happen")
});

static ORPHAN_MITIGATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "service_catalog_orphan_mitigations_total",
            "Total number of orphan mitigations started by resource kind",
        ),
        &["kind"],
    )
    .expect("Failed to create ORPHAN_MITIGATIONS_TOTAL metric - this should never happen")
});

#[allow(
    clippy::missing_errors_doc,
    reason = "Error documentation is provided in doc comments"
)]
pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(BROKER_REQUESTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(BROKER_REQUEST_DURATION.clone()))?;
    REGISTRY.register(Box::new(REQUEUES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ASYNC_POLLS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SECRETS_INJECTED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ORPHAN_MITIGATIONS_TOTAL.clone()))?;
    Ok(())
}

pub fn increment_reconciliations(kind: &str) {
    RECONCILIATIONS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn increment_reconciliation_errors(kind: &str) {
    RECONCILIATION_ERRORS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn observe_reconciliation_duration(kind: &str, duration: f64) {
    RECONCILIATION_DURATION
        .with_label_values(&[kind])
        .observe(duration);
}

/// Record one broker request
///
/// `outcome` is `success`, `error` (broker answered with a failure status) or
/// `transport_error` (no usable answer).
pub fn record_broker_request(operation: &str, outcome: &str, duration: f64) {
    BROKER_REQUESTS_TOTAL
        .with_label_values(&[operation, outcome])
        .inc();
    BROKER_REQUEST_DURATION
        .with_label_values(&[operation])
        .observe(duration);
}

pub fn increment_requeues_total(trigger: &str) {
    REQUEUES_TOTAL.with_label_values(&[trigger]).inc();
}

pub fn increment_async_polls(kind: &str, state: &str) {
    ASYNC_POLLS_TOTAL.with_label_values(&[kind, state]).inc();
}

pub fn increment_secrets_injected() {
    SECRETS_INJECTED_TOTAL.inc();
}

pub fn increment_orphan_mitigations(kind: &str) {
    ORPHAN_MITIGATIONS_TOTAL.with_label_values(&[kind]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_metrics() {
        // This should not panic - metrics should register successfully
        assert!(register_metrics().is_ok());
    }

    #[test]
    fn test_increment_reconciliations() {
        let before = RECONCILIATIONS_TOTAL.with_label_values(&["instance"]).get();
        increment_reconciliations("instance");
        let after = RECONCILIATIONS_TOTAL.with_label_values(&["instance"]).get();
        assert_eq!(after, before + 1u64);
    }

    #[test]
    fn test_increment_reconciliation_errors_is_per_kind() {
        let before_binding = RECONCILIATION_ERRORS_TOTAL
            .with_label_values(&["binding"])
            .get();
        let before_instance = RECONCILIATION_ERRORS_TOTAL
            .with_label_values(&["instance-errors-test"])
            .get();
        increment_reconciliation_errors("binding");
        assert_eq!(
            RECONCILIATION_ERRORS_TOTAL
                .with_label_values(&["binding"])
                .get(),
            before_binding + 1u64
        );
        assert_eq!(
            RECONCILIATION_ERRORS_TOTAL
                .with_label_values(&["instance-errors-test"])
                .get(),
            before_instance
        );
    }

    #[test]
    fn test_observe_reconciliation_duration() {
        observe_reconciliation_duration("binding", 0.25);
        // Just verify it doesn't panic
    }

    #[test]
    fn test_record_broker_request() {
        let before = BROKER_REQUESTS_TOTAL
            .with_label_values(&["unbind", "error"])
            .get();
        let before_success = BROKER_REQUESTS_TOTAL
            .with_label_values(&["unbind", "success"])
            .get();
        record_broker_request("unbind", "error", 0.3);
        assert_eq!(
            BROKER_REQUESTS_TOTAL
                .with_label_values(&["unbind", "error"])
                .get(),
            before + 1u64
        );
        assert_eq!(
            BROKER_REQUESTS_TOTAL
                .with_label_values(&["unbind", "success"])
                .get(),
            before_success
        );
    }

    #[test]
    fn test_increment_requeues_total() {
        let before = REQUEUES_TOTAL.with_label_values(&["async-poll"]).get();
        increment_requeues_total("async-poll");
        let after = REQUEUES_TOTAL.with_label_values(&["async-poll"]).get();
        assert_eq!(after, before + 1u64);
    }

    #[test]
    fn test_increment_async_polls() {
        let before = ASYNC_POLLS_TOTAL
            .with_label_values(&["binding", "failed"])
            .get();
        increment_async_polls("binding", "failed");
        let after = ASYNC_POLLS_TOTAL
            .with_label_values(&["binding", "failed"])
            .get();
        assert_eq!(after, before + 1u64);
    }

    #[test]
    fn test_increment_secrets_injected() {
        let before = SECRETS_INJECTED_TOTAL.get();
        increment_secrets_injected();
        assert_eq!(SECRETS_INJECTED_TOTAL.get(), before + 1u64);
    }

    #[test]
    fn test_increment_orphan_mitigations() {
        let before = ORPHAN_MITIGATIONS_TOTAL
            .with_label_values(&["instance"])
            .get();
        increment_orphan_mitigations("instance");
        let after = ORPHAN_MITIGATIONS_TOTAL
            .with_label_values(&["instance"])
            .get();
        assert_eq!(after, before + 1u64);
    }
}
