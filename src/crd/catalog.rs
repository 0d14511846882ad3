//! # Catalog Resources
//!
//! Broker-advertised classes and plans. The controller only reads these; catalog
//! sync populates them.
//!
//! Cluster-scoped and namespaced variants share their payload through the
//! flattened `Common*Spec` structs so lookups can treat them uniformly.

use serde::{Deserialize, Serialize};

/// Fields shared by `ClusterServiceClass` and `ServiceClass`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CommonServiceClassSpec {
    /// Human-readable name advertised by the broker
    pub external_name: String,
    /// Broker-side id, sent as `service_id`
    #[serde(rename = "externalID")]
    pub external_id: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Whether instances of this class can be bound
    #[serde(default)]
    pub bindable: bool,
    /// Whether an instance may switch plans after creation
    #[serde(default)]
    pub plan_updatable: bool,
    /// Whether the broker supports fetching a binding (GET) after async bind
    #[serde(default)]
    pub binding_retrievable: bool,
}

/// Cluster-scoped service class
#[derive(kube::CustomResource, Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "ClusterServiceClass",
    group = "servicecatalog.k8s.io",
    version = "v1beta1",
    shortname = "csc",
    printcolumn = r#"{"name":"External-Name", "type":"string", "jsonPath":".spec.externalName"}, {"name":"Broker", "type":"string", "jsonPath":".spec.clusterServiceBrokerName"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterServiceClassSpec {
    pub cluster_service_broker_name: String,
    #[serde(flatten)]
    pub common: CommonServiceClassSpec,
}

/// Namespaced service class
#[derive(kube::CustomResource, Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "ServiceClass",
    group = "servicecatalog.k8s.io",
    version = "v1beta1",
    namespaced,
    shortname = "sc",
    printcolumn = r#"{"name":"External-Name", "type":"string", "jsonPath":".spec.externalName"}, {"name":"Broker", "type":"string", "jsonPath":".spec.serviceBrokerName"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceClassSpec {
    pub service_broker_name: String,
    #[serde(flatten)]
    pub common: CommonServiceClassSpec,
}

/// Fields shared by `ClusterServicePlan` and `ServicePlan`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CommonServicePlanSpec {
    pub external_name: String,
    /// Broker-side id, sent as `plan_id`
    #[serde(rename = "externalID")]
    pub external_id: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Overrides the class-level `bindable` flag when set
    #[serde(default)]
    pub bindable: Option<bool>,
    #[serde(default)]
    pub free: bool,
}

/// Reference to a catalog object by Kubernetes name
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
pub struct CatalogObjectReference {
    pub name: String,
}

/// Cluster-scoped service plan
#[derive(kube::CustomResource, Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "ClusterServicePlan",
    group = "servicecatalog.k8s.io",
    version = "v1beta1",
    shortname = "csp",
    printcolumn = r#"{"name":"External-Name", "type":"string", "jsonPath":".spec.externalName"}, {"name":"Class", "type":"string", "jsonPath":".spec.clusterServiceClassRef.name"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterServicePlanSpec {
    pub cluster_service_broker_name: String,
    pub cluster_service_class_ref: CatalogObjectReference,
    #[serde(flatten)]
    pub common: CommonServicePlanSpec,
}

/// Namespaced service plan
#[derive(kube::CustomResource, Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "ServicePlan",
    group = "servicecatalog.k8s.io",
    version = "v1beta1",
    namespaced,
    shortname = "sp",
    printcolumn = r#"{"name":"External-Name", "type":"string", "jsonPath":".spec.externalName"}, {"name":"Class", "type":"string", "jsonPath":".spec.serviceClassRef.name"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServicePlanSpec {
    pub service_broker_name: String,
    pub service_class_ref: CatalogObjectReference,
    #[serde(flatten)]
    pub common: CommonServicePlanSpec,
}
