//! # Reconciler
//!
//! State machines for `ServiceInstance` and `ServiceBinding`.
//!
//! - `instance`: provision, update, deprovision and their async polling
//! - `binding`: bind, credential injection, unbind
//! - `conditions`: condition bookkeeping and reason codes
//! - `outcome`: what a pass asks the runtime to persist
//! - `types`: shared context, errors and retry state
//!
//! A pass takes a snapshot of the resource and returns an [`Outcome`]. Nothing
//! here talks to the Kubernetes API about the resource itself; the runtime
//! writes status and finalizers.

pub mod binding;
pub mod conditions;
pub mod instance;
pub mod outcome;
pub mod types;

pub use binding::reconcile_binding;
pub use instance::reconcile_instance;
pub use outcome::{FinalizerChange, Outcome, Requeue};
pub use types::{BackoffState, Reconciler, ReconcilerError, TriggerSource};

use crate::crd::FINALIZER;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

pub(crate) fn has_finalizer(meta: &ObjectMeta) -> bool {
    meta.finalizers
        .as_ref()
        .is_some_and(|finalizers| finalizers.iter().any(|f| f == FINALIZER))
}

pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::conditions::{reasons, ConditionType, ConditionedStatus, LifecycleState};
    use super::*;
    use crate::broker::{
        BindResponse, BrokerError, BrokerOperation, FakeBrokerClient, LastOperationResponse,
        LastOperationState, ProvisionResponse, StaticBrokerRegistry,
    };
    use crate::catalog::CatalogSnapshot;
    use crate::config::ControllerConfig;
    use crate::crd::{
        DeleteStatus, InstanceOperation, LocalObjectReference, PlanReference, ProvisionStatus,
        ServiceBinding, ServiceBindingSpec, ServiceBindingStatus, ServiceInstance,
        ServiceInstanceSpec, ServiceInstanceStatus,
    };
    use crate::store::{InMemoryInstanceStore, InMemorySecretStore};
    use std::sync::Arc;

    struct Fixture {
        broker: Arc<FakeBrokerClient>,
        catalog: Arc<CatalogSnapshot>,
        secrets: Arc<InMemorySecretStore>,
        instances: Arc<InMemoryInstanceStore>,
        ctx: Reconciler,
    }

    fn fixture() -> Fixture {
        let broker = Arc::new(FakeBrokerClient::new());
        let catalog = Arc::new(CatalogSnapshot::new());
        catalog.insert_class(CatalogSnapshot::cluster_class("db-class", "db", "broker"));
        catalog.insert_plan(CatalogSnapshot::cluster_plan("db-small", "db-class", "small", "broker"));
        let secrets = Arc::new(InMemorySecretStore::new());
        let instances = Arc::new(InMemoryInstanceStore::new());
        let ctx = Reconciler::new(
            Arc::clone(&catalog) as Arc<dyn crate::catalog::CatalogLookup>,
            Arc::new(StaticBrokerRegistry::with_default(
                Arc::clone(&broker) as Arc<dyn crate::broker::BrokerClient>
            )),
            Arc::clone(&secrets) as Arc<dyn crate::store::SecretStore>,
            Arc::clone(&instances) as Arc<dyn crate::store::InstanceLookup>,
            ControllerConfig::default(),
        );
        Fixture {
            broker,
            catalog,
            secrets,
            instances,
            ctx,
        }
    }

    fn instance() -> ServiceInstance {
        let mut instance = ServiceInstance::new(
            "db",
            ServiceInstanceSpec {
                plan_reference: PlanReference::cluster_external_names("db", "small"),
                ..ServiceInstanceSpec::default()
            },
        );
        instance.metadata.namespace = Some("ns".into());
        instance.metadata.generation = Some(1);
        instance.metadata.finalizers = Some(vec![crate::crd::FINALIZER.to_string()]);
        instance
    }

    fn deletion_time() -> k8s_openapi::apimachinery::pkg::apis::meta::v1::Time {
        serde_json::from_value(serde_json::json!("2024-01-01T00:00:00Z")).expect("valid timestamp")
    }

    fn apply_instance(instance: &mut ServiceInstance, outcome: Outcome<ServiceInstanceStatus>) {
        if let Some(status) = outcome.status {
            instance.status = Some(status);
        }
    }

    #[tokio::test]
    async fn test_missing_finalizer_is_added_before_anything_else() {
        let f = fixture();
        let mut fresh = instance();
        fresh.metadata.finalizers = None;
        let outcome = reconcile_instance(&fresh, &f.ctx).await.expect("pass");
        assert_eq!(outcome.finalizer, FinalizerChange::Add);
        assert_eq!(f.broker.count(BrokerOperation::Provision), 0);
    }

    #[tokio::test]
    async fn test_provision_is_recorded_then_issued() {
        let f = fixture();
        let mut instance = instance();

        let recorded = reconcile_instance(&instance, &f.ctx).await.expect("record");
        assert_eq!(
            recorded.requeue,
            Requeue::now(TriggerSource::OperationRecorded)
        );
        let status = recorded.status.clone().expect("status written");
        assert_eq!(status.current_operation, Some(InstanceOperation::Provision));
        assert_eq!(status.deprovision_status, Some(DeleteStatus::Required));
        assert!(status.external_id.is_some());
        assert_eq!(
            status.last_condition_state.as_deref(),
            Some(reasons::PROVISION_REQUEST_IN_FLIGHT)
        );
        assert_eq!(f.broker.count(BrokerOperation::Provision), 0);
        apply_instance(&mut instance, recorded);

        let issued = reconcile_instance(&instance, &f.ctx).await.expect("issue");
        apply_instance(&mut instance, issued);
        let status = instance.status.as_ref().expect("status");
        assert_eq!(f.broker.count(BrokerOperation::Provision), 1);
        assert_eq!(status.provision_status, Some(ProvisionStatus::Provisioned));
        assert_eq!(status.lifecycle_state(), LifecycleState::Ready);
        assert!(status.current_operation.is_none());
        assert_eq!(
            status
                .external_properties
                .as_ref()
                .and_then(|p| p.plan_external_id.as_deref()),
            Some("small-id")
        );

        f.broker.clear_actions();
        let steady = reconcile_instance(&instance, &f.ctx).await.expect("steady");
        assert!(!steady.status_changed());
        assert!(f.broker.actions().is_empty());
    }

    #[tokio::test]
    async fn test_async_provision_polls_until_done() {
        let f = fixture();
        f.broker.on_provision(|_| {
            Ok(ProvisionResponse {
                is_async: true,
                dashboard_url: None,
                operation_key: Some("op-1".into()),
            })
        });
        f.broker.on_poll_last_operation(|request| {
            assert_eq!(request.operation_key.as_deref(), Some("op-1"));
            Ok(LastOperationResponse {
                state: LastOperationState::InProgress,
                description: Some("halfway".into()),
            })
        });
        let mut instance = instance();
        for _ in 0..2 {
            let outcome = reconcile_instance(&instance, &f.ctx).await.expect("pass");
            apply_instance(&mut instance, outcome);
        }
        let status = instance.status.clone().expect("status");
        assert!(status.async_op_in_progress);
        assert_eq!(status.last_condition_state.as_deref(), Some(reasons::PROVISIONING));

        let polled = reconcile_instance(&instance, &f.ctx).await.expect("poll");
        assert!(matches!(
            polled.requeue,
            Requeue::After(_, TriggerSource::AsyncPoll)
        ));
        apply_instance(&mut instance, polled);
        let ready = conditions::find_condition(
            &instance.status.as_ref().expect("status").conditions,
            ConditionType::Ready,
        )
        .and_then(|c| c.message.clone());
        assert_eq!(ready.as_deref(), Some("halfway"));

        f.broker.on_poll_last_operation(|_| {
            Ok(LastOperationResponse {
                state: LastOperationState::Succeeded,
                description: None,
            })
        });
        let done = reconcile_instance(&instance, &f.ctx).await.expect("done");
        apply_instance(&mut instance, done);
        let status = instance.status.as_ref().expect("status");
        assert!(!status.async_op_in_progress);
        assert_eq!(status.provision_status, Some(ProvisionStatus::Provisioned));
    }

    #[tokio::test]
    async fn test_ambiguous_provision_failure_starts_orphan_mitigation() {
        let f = fixture();
        f.broker.on_provision(|_| Err(BrokerError::http(500)));
        let mut instance = instance();
        for _ in 0..2 {
            let outcome = reconcile_instance(&instance, &f.ctx).await.expect("pass");
            apply_instance(&mut instance, outcome);
        }
        let status = instance.status.clone().expect("status");
        assert!(status.orphan_mitigation_in_progress);
        assert_eq!(status.current_operation, Some(InstanceOperation::Deprovision));
        assert!(conditions::is_true(&status.conditions, ConditionType::OrphanMitigation));

        let mitigated = reconcile_instance(&instance, &f.ctx).await.expect("deprovision");
        assert!(matches!(
            mitigated.requeue,
            Requeue::After(_, TriggerSource::ErrorBackoff)
        ));
        apply_instance(&mut instance, mitigated);
        let status = instance.status.as_ref().expect("status");
        assert_eq!(f.broker.count(BrokerOperation::Deprovision), 1);
        assert!(!status.orphan_mitigation_in_progress);
        assert!(status.current_operation.is_none());
        assert!(!conditions::is_true(&status.conditions, ConditionType::OrphanMitigation));
    }

    #[tokio::test]
    async fn test_terminal_provision_failure_waits_for_spec_change() {
        let f = fixture();
        f.broker
            .on_provision(|_| Err(BrokerError::http_with_description(400, "bad plan")));
        let mut instance = instance();
        for _ in 0..2 {
            let outcome = reconcile_instance(&instance, &f.ctx).await.expect("pass");
            apply_instance(&mut instance, outcome);
        }
        assert_eq!(
            instance.status.as_ref().expect("status").lifecycle_state(),
            LifecycleState::Failed
        );
        let idle = reconcile_instance(&instance, &f.ctx).await.expect("idle");
        assert_eq!(idle.requeue, Requeue::AwaitChange);
        assert_eq!(f.broker.count(BrokerOperation::Provision), 1);

        instance.metadata.generation = Some(2);
        let retried = reconcile_instance(&instance, &f.ctx).await.expect("new generation");
        assert_eq!(
            retried.status.and_then(|s| s.current_operation),
            Some(InstanceOperation::Provision)
        );
    }

    #[tokio::test]
    async fn test_catalog_miss_retries_then_fails() {
        let f = fixture();
        f.catalog
            .remove_class(&crate::catalog::CatalogScope::Cluster, "db-class");
        let mut instance = instance();
        let limit = f.ctx.config.catalog_not_found_retry_limit;
        for _ in 0..limit {
            let outcome = reconcile_instance(&instance, &f.ctx).await.expect("miss");
            assert!(matches!(
                outcome.requeue,
                Requeue::After(_, TriggerSource::WaitingForResource)
            ));
            apply_instance(&mut instance, outcome);
        }
        let last = reconcile_instance(&instance, &f.ctx).await.expect("give up");
        assert_eq!(last.requeue, Requeue::AwaitChange);
        apply_instance(&mut instance, last);
        let status = instance.status.as_ref().expect("status");
        assert_eq!(status.lifecycle_state(), LifecycleState::Failed);
        assert_eq!(
            status.last_condition_state.as_deref(),
            Some(reasons::REFERENCES_NONEXISTENT_SERVICE_CLASS)
        );
    }

    #[tokio::test]
    async fn test_deleting_unprovisioned_instance_releases_finalizer() {
        let f = fixture();
        let mut instance = instance();
        instance.metadata.deletion_timestamp = Some(deletion_time());
        let outcome = reconcile_instance(&instance, &f.ctx).await.expect("delete");
        assert_eq!(outcome.finalizer, FinalizerChange::Remove);
        assert_eq!(f.broker.count(BrokerOperation::Deprovision), 0);
    }

    fn ready_instance() -> ServiceInstance {
        let mut instance = instance();
        let mut status = ServiceInstanceStatus {
            external_id: Some("instance-1".into()),
            provision_status: Some(ProvisionStatus::Provisioned),
            deprovision_status: Some(DeleteStatus::Required),
            resolved_references: Some(crate::crd::ResolvedReferences {
                scope: crate::crd::ReferenceScope::Cluster,
                class_name: "db-class".into(),
                plan_name: "db-small".into(),
                broker_name: "broker".into(),
            }),
            ..ServiceInstanceStatus::default()
        };
        status.set_ready(
            conditions::ConditionStatus::True,
            reasons::PROVISIONED_SUCCESSFULLY,
            "",
        );
        instance.status = Some(status);
        instance
    }

    fn binding() -> ServiceBinding {
        let mut binding = ServiceBinding::new(
            "db-binding",
            ServiceBindingSpec {
                instance_ref: LocalObjectReference { name: "db".into() },
                ..ServiceBindingSpec::default()
            },
        );
        binding.metadata.namespace = Some("ns".into());
        binding.metadata.generation = Some(1);
        binding.metadata.finalizers = Some(vec![crate::crd::FINALIZER.to_string()]);
        binding
    }

    fn apply_binding(binding: &mut ServiceBinding, outcome: Outcome<ServiceBindingStatus>) {
        if let Some(status) = outcome.status {
            binding.status = Some(status);
        }
    }

    #[tokio::test]
    async fn test_binding_waits_for_missing_instance() {
        let f = fixture();
        let outcome = reconcile_binding(&binding(), &f.ctx).await.expect("pass");
        assert!(matches!(
            outcome.requeue,
            Requeue::After(_, TriggerSource::WaitingForResource)
        ));
        assert_eq!(
            outcome.status.and_then(|s| s.last_condition_state),
            Some(reasons::ERROR_NONEXISTENT_INSTANCE.to_string())
        );
        assert_eq!(f.broker.count(BrokerOperation::Bind), 0);
    }

    #[tokio::test]
    async fn test_bind_injects_credentials() {
        let f = fixture();
        f.instances.insert(ready_instance());
        f.broker.on_bind(|request| {
            assert_eq!(request.instance_id, "instance-1");
            assert_eq!(request.plan_id, "small-id");
            let mut credentials = serde_json::Map::new();
            credentials.insert("uri".into(), "postgres://db".into());
            Ok(BindResponse {
                is_async: false,
                credentials: Some(credentials),
                operation_key: None,
            })
        });
        let mut binding = binding();
        for _ in 0..2 {
            let outcome = reconcile_binding(&binding, &f.ctx).await.expect("pass");
            apply_binding(&mut binding, outcome);
        }
        let status = binding.status.as_ref().expect("status");
        assert_eq!(status.lifecycle_state(), LifecycleState::Ready);
        assert_eq!(status.unbind_status, Some(DeleteStatus::Required));
        assert_eq!(
            f.secrets
                .data("ns", "db-binding")
                .and_then(|d| d.get("uri").cloned()),
            Some(b"postgres://db".to_vec())
        );

        f.broker.clear_actions();
        let steady = reconcile_binding(&binding, &f.ctx).await.expect("steady");
        assert!(!steady.status_changed());
        assert!(f.broker.actions().is_empty());
    }

    #[tokio::test]
    async fn test_unbind_on_delete_removes_secret_and_finalizer() {
        let f = fixture();
        f.instances.insert(ready_instance());
        let mut binding = binding();
        for _ in 0..2 {
            let outcome = reconcile_binding(&binding, &f.ctx).await.expect("pass");
            apply_binding(&mut binding, outcome);
        }
        assert!(f.secrets.contains("ns", "db-binding"));

        binding.metadata.deletion_timestamp = Some(deletion_time());
        let recorded = reconcile_binding(&binding, &f.ctx).await.expect("record unbind");
        apply_binding(&mut binding, recorded);
        let finished = reconcile_binding(&binding, &f.ctx).await.expect("unbind");
        assert_eq!(finished.finalizer, FinalizerChange::Remove);
        assert_eq!(f.broker.count(BrokerOperation::Unbind), 1);
        assert!(!f.secrets.contains("ns", "db-binding"));
    }
}
