//! # Custom Resource Definitions
//!
//! CRD types for the Service Catalog Controller.
//!
//! ## Module Structure
//!
//! - `instance.rs` - `ServiceInstance` spec, plan references and status
//! - `binding.rs` - `ServiceBinding` spec and status
//! - `catalog.rs` - Cluster-scoped and namespaced classes and plans (read-only)
//! - `broker.rs` - Cluster-scoped and namespaced brokers (read-only)
//! - `parameters.rs` - `parametersFrom` sources shared by instances and bindings
//! - `transform.rs` - Secret transform wire types
//! - `status.rs` - Conditions and lifecycle enums

mod binding;
mod broker;
mod catalog;
mod instance;
mod parameters;
mod status;
mod transform;

// Re-export all public types
pub use binding::{
    BindingPropertiesState, BindingResolvedReferences, LocalObjectReference, ServiceBinding,
    ServiceBindingSpec, ServiceBindingStatus,
};
pub use broker::{
    BrokerAuthInfo, ClusterServiceBroker, ClusterServiceBrokerSpec, CommonServiceBrokerSpec,
    SecretAuthConfig, SecretReference, ServiceBroker, ServiceBrokerSpec,
};
pub use catalog::{
    CatalogObjectReference, ClusterServiceClass, ClusterServiceClassSpec, ClusterServicePlan,
    ClusterServicePlanSpec, CommonServiceClassSpec, CommonServicePlanSpec, ServiceClass,
    ServiceClassSpec, ServicePlan, ServicePlanSpec,
};
pub use instance::{
    InstancePropertiesState, PlanReference, ResolvedReferences, ServiceInstance,
    ServiceInstanceSpec, ServiceInstanceStatus,
};
pub use parameters::{free_form_object, ParametersFromSource, SecretKeyReference};
pub use status::{
    BindingOperation, Condition, DeleteStatus, InstanceOperation, ProvisionStatus,
    ReferenceScope,
};
pub use transform::{
    AddKeyTransform, AddKeysFromTransform, ObjectReference, RemoveKeyTransform,
    RenameKeyTransform, SecretTransform,
};

/// Finalizer guarding broker-side cleanup of instances and bindings
pub const FINALIZER: &str = "servicecatalog.k8s.io/finalizer";
