//! # ServiceBinding
//!
//! A request for credentials to a provisioned `ServiceInstance`, materialized as
//! a Kubernetes secret.

use crate::crd::{
    BindingOperation, Condition, DeleteStatus, ParametersFromSource, ReferenceScope,
    SecretTransform,
};
use serde::{Deserialize, Serialize};

/// ServiceBinding Custom Resource Definition
///
/// # Example
///
/// ```yaml
/// apiVersion: servicecatalog.k8s.io/v1beta1
/// kind: ServiceBinding
/// metadata:
///   name: my-database-binding
///   namespace: default
/// spec:
///   instanceRef:
///     name: my-database
///   secretName: my-database-credentials
///   secretTransforms:
///     - renameKey:
///         from: uri
///         to: DATABASE_URL
/// ```
#[derive(kube::CustomResource, Debug, Clone, Default, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "ServiceBinding",
    group = "servicecatalog.k8s.io",
    version = "v1beta1",
    namespaced,
    status = "crate::crd::ServiceBindingStatus",
    shortname = "sbd",
    printcolumn = r#"{"name":"Service-Instance", "type":"string", "jsonPath":".spec.instanceRef.name"}, {"name":"Secret-Name", "type":"string", "jsonPath":".spec.secretName"}, {"name":"Status", "type":"string", "jsonPath":".status.lastConditionState"}, {"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBindingSpec {
    /// Instance in the same namespace; immutable once bound
    pub instance_ref: LocalObjectReference,
    #[serde(default)]
    #[schemars(schema_with = "crate::crd::free_form_object")]
    pub parameters: Option<serde_json::Value>,
    #[serde(default)]
    pub parameters_from: Vec<ParametersFromSource>,
    /// Secret receiving the credentials; defaults to the binding name
    #[serde(default)]
    pub secret_name: Option<String>,
    /// Mutations applied in order to the credentials before they are stored
    #[serde(default)]
    pub secret_transforms: Vec<SecretTransform>,
    /// Broker-facing binding id; generated when absent
    #[serde(default, rename = "externalID")]
    pub external_id: Option<String>,
}

/// Reference to an object in the same namespace
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
pub struct LocalObjectReference {
    pub name: String,
}

/// Status of the ServiceBinding resource
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBindingStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub async_op_in_progress: bool,
    /// True while an unbind is cleaning up after an ambiguous bind failure
    #[serde(default)]
    pub orphan_mitigation_in_progress: bool,
    #[serde(default)]
    pub last_operation: Option<String>,
    #[serde(default)]
    pub current_operation: Option<BindingOperation>,
    #[serde(default)]
    pub operation_start_time: Option<String>,
    #[serde(default)]
    pub in_progress_properties: Option<BindingPropertiesState>,
    #[serde(default)]
    pub external_properties: Option<BindingPropertiesState>,
    /// Broker coordinates captured when the bind was issued
    #[serde(default)]
    pub resolved_references: Option<BindingResolvedReferences>,
    #[serde(default, rename = "externalID")]
    pub external_id: Option<String>,
    #[serde(default)]
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub reconciled_generation: Option<i64>,
    #[serde(default)]
    pub unbind_status: Option<DeleteStatus>,
    #[serde(default)]
    pub last_condition_state: Option<String>,
}

/// Parameters applied (or being applied) on the broker
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BindingPropertiesState {
    /// Parameters with secret-sourced values redacted
    #[serde(default)]
    #[schemars(schema_with = "crate::crd::free_form_object")]
    pub parameters: Option<serde_json::Value>,
    #[serde(default)]
    pub parameter_checksum: Option<String>,
}

/// Everything an unbind needs without consulting the instance or the catalog
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BindingResolvedReferences {
    pub scope: ReferenceScope,
    pub broker_name: String,
    #[serde(rename = "instanceExternalID")]
    pub instance_external_id: String,
    #[serde(rename = "classExternalID")]
    pub class_external_id: String,
    #[serde(rename = "planExternalID")]
    pub plan_external_id: String,
}

impl ServiceBinding {
    /// Name of the secret receiving the credentials
    #[must_use]
    pub fn secret_name(&self) -> String {
        self.spec
            .secret_name
            .clone()
            .filter(|name| !name.is_empty())
            .or_else(|| self.metadata.name.clone())
            .unwrap_or_default()
    }
}
