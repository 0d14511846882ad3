//! # Error Policy
//!
//! Requeue decisions for failed passes and classification of watch stream errors.

use crate::controller::reconciler::{Reconciler, ReconcilerError};
use crate::observability::metrics;
use crate::runtime::ControllerContext;
use kube::{Resource, ResourceExt};
use kube_runtime::controller::Action;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Instrument};

/// Handle a failed pass with per-resource exponential backoff
///
/// Write conflicts mean the cache was behind; they are retried after the
/// shortest backoff without growing the resource's delay.
pub fn handle_reconciliation_error<K>(
    obj: &Arc<K>,
    error: &ReconcilerError,
    ctx: &Arc<ControllerContext>,
    kind: &str,
) -> Action
where
    K: Resource<DynamicType = ()>,
{
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_default();

    let error_span = tracing::span!(
        tracing::Level::ERROR,
        "controller.watch.reconciliation_error",
        resource.kind = kind,
        resource.name = name.as_str(),
        resource.namespace = namespace.as_str(),
        error = %error
    );
    let _error_guard = error_span.enter();

    if let ReconcilerError::Conflict(_) = error {
        let delay = ctx.reconciler.config.backoff_start_duration();
        info!(
            "🔁 Status of {} {}/{} changed underneath this pass, retrying in {:?}",
            kind, namespace, name, delay
        );
        metrics::increment_requeues_total("conflict");
        return Action::requeue(delay);
    }

    error!("Reconciliation error for {} {}/{}: {:?}", kind, namespace, name, error);
    metrics::increment_reconciliation_errors(kind);

    let key = Reconciler::backoff_key(kind, &namespace, &name);
    let generation = obj.meta().generation.unwrap_or_default();
    let delay = ctx
        .reconciler
        .with_backoff(&key, generation, |state| state.backoff.next_backoff());

    let next_trigger_time = chrono::Utc::now()
        + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
    info!(
        "🔄 Retrying with exponential backoff: {:?} (trigger source: error-backoff)",
        delay
    );
    info!(
        "📅 Next retry scheduled: {} (trigger source: error-backoff)",
        next_trigger_time.to_rfc3339()
    );

    metrics::increment_requeues_total("error-backoff");
    Action::requeue(delay)
}

/// Classify a watch stream error and wait as appropriate
///
/// Returns `None` to drop the error and let the watch restart, `Some(())` to
/// keep going.
pub async fn handle_watch_stream_error(
    error_string: &str,
    backoff: &Arc<AtomicU64>,
    max_backoff_ms: u64,
    watch_restart_delay: Duration,
) -> Option<()> {
    let error_span = tracing::span!(
        tracing::Level::WARN,
        "controller.watch.error",
        error = %error_string
    );
    classify_watch_error(error_string, backoff, max_backoff_ms, watch_restart_delay)
        .instrument(error_span)
        .await
}

async fn classify_watch_error(
    error_string: &str,
    backoff: &Arc<AtomicU64>,
    max_backoff_ms: u64,
    watch_restart_delay: Duration,
) -> Option<()> {
    // 404 first: a plain-text 404 body surfaces as a decode error mentioning WatchFailed
    let is_not_found = error_string.contains("ObjectNotFound")
        || error_string.contains("404")
        || error_string.contains("not found");
    let is_401 =
        (error_string.contains("401") || error_string.contains("Unauthorized")) && !is_not_found;
    let is_410 = error_string.contains("410")
        || error_string.contains("too old resource version")
        || error_string.contains("Expired")
        || error_string.contains("Gone");
    let is_429 = error_string.contains("429")
        || error_string.contains("storage is (re)initializing")
        || error_string.contains("TooManyRequests");

    if is_401 {
        error!("❌ Watch authentication failed (401 Unauthorized) - RBAC may have been revoked or token expired");
        error!("🔍 SRE Diagnostics:");
        error!("   1. Verify ClusterRole 'service-catalog-controller' still exists:");
        error!("      kubectl get clusterrole service-catalog-controller");
        error!("   2. Verify the ClusterRoleBinding still binds the ServiceAccount:");
        error!("      kubectl get clusterrolebinding service-catalog-controller -o yaml");
        error!("   3. Verify RBAC permissions are still active:");
        error!(
            "      kubectl auth can-i watch serviceinstances.servicecatalog.k8s.io --as=system:serviceaccount:service-catalog:service-catalog-controller --all-namespaces"
        );
        error!("   4. If RBAC was recently changed, restart the controller pod");
        warn!(
            "⏳ Waiting {:?} before retrying watch (RBAC may need time to propagate)...",
            watch_restart_delay
        );
        tokio::time::sleep(watch_restart_delay).await;
        None
    } else if is_410 {
        warn!("Watch resource version expired (410), watch will restart");
        warn!(error_type = "410", "watch.error.resource_version_expired");
        None
    } else if is_429 {
        let current_backoff = backoff.load(Ordering::Relaxed);
        warn!(
            "API server storage reinitializing (429), backing off for {}ms before restart...",
            current_backoff
        );
        tokio::time::sleep(Duration::from_millis(current_backoff)).await;
        backoff.store(
            current_backoff.saturating_mul(2).min(max_backoff_ms),
            Ordering::Relaxed,
        );
        None
    } else if is_not_found {
        let resource_info = if error_string.contains("integer `404`") {
            "CRD or resource may have been deleted (404 returned as plain text)"
        } else if error_string.contains("ServiceInstance") {
            "ServiceInstance resource"
        } else if error_string.contains("ServiceBinding") {
            "ServiceBinding resource"
        } else {
            "Resource"
        };
        warn!(
            "{} not found (404) - normal if the resource was deleted, otherwise check the CRDs are installed. Error: {}",
            resource_info, error_string
        );
        Some(())
    } else {
        error!("Controller stream error: {}", error_string);
        tokio::time::sleep(watch_restart_delay).await;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_not_found_keeps_stream_and_429_doubles_backoff() {
        let backoff = Arc::new(AtomicU64::new(1));
        let kept = handle_watch_stream_error(
            "ObjectNotFound: serviceinstances",
            &backoff,
            8,
            Duration::ZERO,
        )
        .await;
        assert_eq!(kept, Some(()));

        for expected in [2, 4, 8, 8] {
            let dropped =
                handle_watch_stream_error("429 TooManyRequests", &backoff, 8, Duration::ZERO).await;
            assert_eq!(dropped, None);
            assert_eq!(backoff.load(Ordering::Relaxed), expected);
        }
    }
}
