//! Shared test harness
//!
//! `World` wires the state machines to in-memory collaborators and plays the
//! role of the API server: it applies each pass's outcome to the object the way
//! the runtime would, and drops the object once its finalizer is released.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use service_catalog_controller::broker::{
    BrokerClient, FakeBrokerClient, StaticBrokerRegistry,
};
use service_catalog_controller::catalog::{CatalogLookup, CatalogSnapshot};
use service_catalog_controller::config::ControllerConfig;
use service_catalog_controller::controller::reconciler::{
    reconcile_binding, reconcile_instance, Outcome, Reconciler, Requeue, TriggerSource,
};
use service_catalog_controller::crd::{
    LocalObjectReference, PlanReference, ServiceBinding, ServiceBindingSpec,
    ServiceBindingStatus, ServiceInstance, ServiceInstanceSpec, ServiceInstanceStatus, FINALIZER,
};
use service_catalog_controller::runtime::persist::finalizers_after;
use service_catalog_controller::store::{
    InMemoryInstanceStore, InMemorySecretStore, InstanceLookup, SecretStore,
};
use std::sync::{Arc, Once};

pub const NAMESPACE: &str = "test-ns";

/// Upper bound on passes before a resource is considered stuck
const MAX_STEPS: usize = 50;

static RUSTLS_INIT: Once = Once::new();

/// Install the ring crypto provider once per test binary
pub fn init_rustls() {
    RUSTLS_INIT.call_once(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .expect("Failed to install rustls crypto provider");
    });
}

pub struct World {
    pub broker: Arc<FakeBrokerClient>,
    pub catalog: Arc<CatalogSnapshot>,
    pub secrets: Arc<InMemorySecretStore>,
    pub instances: Arc<InMemoryInstanceStore>,
    pub reconciler: Reconciler,
}

impl World {
    /// A catalog with class `db` (broker `broker`) and plans `small` and `large`
    pub fn new() -> Self {
        Self::with_config(ControllerConfig::default())
    }

    pub fn with_config(config: ControllerConfig) -> Self {
        let broker = Arc::new(FakeBrokerClient::new());
        let catalog = Arc::new(CatalogSnapshot::new());
        catalog.insert_class(CatalogSnapshot::cluster_class("db-class", "db", "broker"));
        catalog.insert_plan(CatalogSnapshot::cluster_plan(
            "db-small", "db-class", "small", "broker",
        ));
        catalog.insert_plan(CatalogSnapshot::cluster_plan(
            "db-large", "db-class", "large", "broker",
        ));
        let secrets = Arc::new(InMemorySecretStore::new());
        let instances = Arc::new(InMemoryInstanceStore::new());
        let reconciler = Reconciler::new(
            Arc::clone(&catalog) as Arc<dyn CatalogLookup>,
            Arc::new(StaticBrokerRegistry::with_default(
                Arc::clone(&broker) as Arc<dyn BrokerClient>
            )),
            Arc::clone(&secrets) as Arc<dyn SecretStore>,
            Arc::clone(&instances) as Arc<dyn InstanceLookup>,
            config,
        );
        Self {
            broker,
            catalog,
            secrets,
            instances,
            reconciler,
        }
    }

    /// Run one instance pass and apply its outcome
    pub async fn step_instance(
        &self,
        slot: &mut Option<ServiceInstance>,
    ) -> Outcome<ServiceInstanceStatus> {
        let instance = slot.as_ref().expect("instance still exists");
        let outcome = reconcile_instance(instance, &self.reconciler)
            .await
            .expect("instance pass succeeds");
        let mut updated = instance.clone();
        let finalizers = finalizers_after(
            updated.metadata.finalizers.as_deref().unwrap_or_default(),
            outcome.finalizer,
        );
        if let Some(status) = &outcome.status {
            updated.status = Some(status.clone());
        }
        updated.metadata.finalizers = Some(finalizers);

        if is_released(&updated.metadata) {
            self.instances
                .remove(NAMESPACE, updated.metadata.name.as_deref().unwrap_or_default());
            *slot = None;
        } else {
            self.instances.insert(updated.clone());
            *slot = Some(updated);
        }
        outcome
    }

    /// Run instance passes until it settles; returns the final outcome
    pub async fn converge_instance(
        &self,
        slot: &mut Option<ServiceInstance>,
    ) -> Outcome<ServiceInstanceStatus> {
        for _ in 0..MAX_STEPS {
            let outcome = self.step_instance(slot).await;
            if slot.is_none() || settled(outcome.requeue) {
                return outcome;
            }
        }
        panic!("instance did not settle within {MAX_STEPS} passes");
    }

    /// Run one binding pass and apply its outcome
    pub async fn step_binding(
        &self,
        slot: &mut Option<ServiceBinding>,
    ) -> Outcome<ServiceBindingStatus> {
        let binding = slot.as_ref().expect("binding still exists");
        let outcome = reconcile_binding(binding, &self.reconciler)
            .await
            .expect("binding pass succeeds");
        let mut updated = binding.clone();
        let finalizers = finalizers_after(
            updated.metadata.finalizers.as_deref().unwrap_or_default(),
            outcome.finalizer,
        );
        if let Some(status) = &outcome.status {
            updated.status = Some(status.clone());
        }
        updated.metadata.finalizers = Some(finalizers);

        *slot = if is_released(&updated.metadata) {
            None
        } else {
            Some(updated)
        };
        outcome
    }

    /// Run binding passes until it settles; returns the final outcome
    pub async fn converge_binding(
        &self,
        slot: &mut Option<ServiceBinding>,
    ) -> Outcome<ServiceBindingStatus> {
        for _ in 0..MAX_STEPS {
            let outcome = self.step_binding(slot).await;
            if slot.is_none() || settled(outcome.requeue) {
                return outcome;
            }
        }
        panic!("binding did not settle within {MAX_STEPS} passes");
    }

    /// Provision `db` on plan `small` and return it in its ready state
    pub async fn ready_instance(&self) -> Option<ServiceInstance> {
        let mut slot = Some(instance("db", "small"));
        self.converge_instance(&mut slot).await;
        self.broker.clear_actions();
        slot
    }
}

fn is_released(meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> bool {
    meta.deletion_timestamp.is_some() && meta.finalizers.as_ref().is_none_or(Vec::is_empty)
}

/// Nothing left to do until something changes or the resync timer fires
fn settled(requeue: Requeue) -> bool {
    matches!(
        requeue,
        Requeue::AwaitChange | Requeue::After(_, TriggerSource::Resync)
    )
}

pub fn deletion_time() -> Time {
    serde_json::from_value(serde_json::json!("2024-01-01T00:00:00Z")).expect("valid timestamp")
}

/// Mark an object for deletion the way the API server does
pub fn mark_deleted(meta: &mut k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) {
    meta.deletion_timestamp = Some(deletion_time());
}

/// A generation-1 instance of class `db` on `plan`, finalizer already present
pub fn instance(name: &str, plan: &str) -> ServiceInstance {
    let mut instance = ServiceInstance::new(
        name,
        ServiceInstanceSpec {
            plan_reference: PlanReference::cluster_external_names("db", plan),
            ..ServiceInstanceSpec::default()
        },
    );
    instance.metadata.namespace = Some(NAMESPACE.into());
    instance.metadata.generation = Some(1);
    instance.metadata.uid = Some(format!("{name}-uid"));
    instance.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
    instance
}

/// A generation-1 binding to `instance_name`, finalizer already present
pub fn binding(name: &str, instance_name: &str) -> ServiceBinding {
    let mut binding = ServiceBinding::new(
        name,
        ServiceBindingSpec {
            instance_ref: LocalObjectReference {
                name: instance_name.to_string(),
            },
            ..ServiceBindingSpec::default()
        },
    );
    binding.metadata.namespace = Some(NAMESPACE.into());
    binding.metadata.generation = Some(1);
    binding.metadata.uid = Some(format!("{name}-uid"));
    binding.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
    binding
}

/// Secret contents as UTF-8 strings
pub fn secret_strings(world: &World, name: &str) -> Vec<(String, String)> {
    world
        .secrets
        .data(NAMESPACE, name)
        .unwrap_or_default()
        .into_iter()
        .map(|(key, value)| (key, String::from_utf8_lossy(&value).into_owned()))
        .collect()
}
