//! # Persist
//!
//! Applies an [`Outcome`] to the API server.
//!
//! Writes carry the `resourceVersion` the pass read, so a pass computed from a
//! stale cache entry loses with a conflict instead of overwriting newer status.
//! The finalizer is added before status is written and removed last; once it is
//! removed the object may vanish, so no status is written alongside.

use crate::controller::reconciler::{FinalizerChange, Outcome, ReconcilerError, Requeue};
use crate::crd::FINALIZER;
use crate::observability::metrics;
use kube::api::{Api, Patch, PatchParams};
use kube::{Resource, ResourceExt};
use kube_runtime::controller::Action;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::fmt::Debug;
use tracing::debug;

fn map_conflict(name: &str, error: kube::Error) -> ReconcilerError {
    match error {
        kube::Error::Api(api_err) if api_err.code == 409 => {
            ReconcilerError::Conflict(name.to_string())
        }
        other => ReconcilerError::Kube(other),
    }
}

/// Finalizer list after applying `change`
#[must_use]
pub fn finalizers_after(current: &[String], change: FinalizerChange) -> Vec<String> {
    let mut finalizers: Vec<String> = current.to_vec();
    match change {
        FinalizerChange::Unchanged => {}
        FinalizerChange::Add => {
            if !finalizers.iter().any(|f| f == FINALIZER) {
                finalizers.push(FINALIZER.to_string());
            }
        }
        FinalizerChange::Remove => finalizers.retain(|f| f != FINALIZER),
    }
    finalizers
}

/// Requeue decision as a controller action
#[must_use]
pub fn requeue_action(requeue: Requeue) -> Action {
    match requeue {
        Requeue::AwaitChange => Action::await_change(),
        Requeue::After(delay, trigger) => {
            metrics::increment_requeues_total(trigger.as_str());
            Action::requeue(delay)
        }
    }
}

async fn patch_finalizers<K>(
    api: &Api<K>,
    obj: &K,
    resource_version: Option<String>,
    change: FinalizerChange,
) -> Result<Option<K>, ReconcilerError>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    let name = obj.name_any();
    let finalizers = finalizers_after(obj.finalizers(), change);
    let patch = json!({
        "metadata": {
            "finalizers": finalizers,
            "resourceVersion": resource_version,
        }
    });
    match api
        .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        Ok(updated) => Ok(Some(updated)),
        Err(kube::Error::Api(api_err)) if api_err.code == 404 => {
            debug!(resource.name = name.as_str(), "persist.finalizer.object_gone");
            Ok(None)
        }
        Err(e) => Err(map_conflict(&name, e)),
    }
}

/// Write the outcome of one pass and turn its requeue into an action
///
/// # Errors
/// A stale `resourceVersion` yields `ReconcilerError::Conflict`; other API
/// failures yield `ReconcilerError::Kube`.
pub async fn apply_outcome<K, S>(
    api: &Api<K>,
    obj: &K,
    outcome: Outcome<S>,
) -> Result<Action, ReconcilerError>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
    S: Serialize,
{
    let name = obj.name_any();
    let mut resource_version = obj.resource_version();

    if outcome.finalizer == FinalizerChange::Add {
        match patch_finalizers(api, obj, resource_version.clone(), FinalizerChange::Add).await? {
            Some(updated) => resource_version = updated.resource_version(),
            None => return Ok(Action::await_change()),
        }
    }

    if outcome.finalizer != FinalizerChange::Remove {
        if let Some(status) = &outcome.status {
            let patch = json!({
                "metadata": { "resourceVersion": resource_version },
                "status": status,
            });
            api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
                .map_err(|e| map_conflict(&name, e))?;
            debug!(resource.name = name.as_str(), "persist.status.written");
        }
    }

    if outcome.finalizer == FinalizerChange::Remove {
        patch_finalizers(api, obj, resource_version, FinalizerChange::Remove).await?;
        debug!(resource.name = name.as_str(), "persist.finalizer.removed");
    }

    Ok(requeue_action(outcome.requeue))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finalizer_changes() {
        let others = vec!["other/finalizer".to_string()];
        let added = finalizers_after(&others, FinalizerChange::Add);
        assert_eq!(added, vec!["other/finalizer".to_string(), FINALIZER.to_string()]);
        assert_eq!(finalizers_after(&added, FinalizerChange::Add), added);
        assert_eq!(finalizers_after(&added, FinalizerChange::Remove), others);
        assert_eq!(finalizers_after(&others, FinalizerChange::Unchanged), others);
    }
}
