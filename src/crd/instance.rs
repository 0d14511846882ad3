//! # ServiceInstance
//!
//! A user's request for a provisioned unit of a broker-offered service.

use crate::crd::{
    Condition, DeleteStatus, InstanceOperation, ParametersFromSource, ProvisionStatus,
    ReferenceScope,
};
use serde::{Deserialize, Serialize};

/// ServiceInstance Custom Resource Definition
///
/// # Example
///
/// ```yaml
/// apiVersion: servicecatalog.k8s.io/v1beta1
/// kind: ServiceInstance
/// metadata:
///   name: my-database
///   namespace: default
/// spec:
///   clusterServiceClassExternalName: postgres
///   clusterServicePlanExternalName: small
///   parameters:
///     version: "15"
///   parametersFrom:
///     - secretKeyRef:
///         name: db-params
///         key: extra
/// ```
#[derive(kube::CustomResource, Debug, Clone, Default, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "ServiceInstance",
    group = "servicecatalog.k8s.io",
    version = "v1beta1",
    namespaced,
    status = "crate::crd::ServiceInstanceStatus",
    shortname = "si",
    printcolumn = r#"{"name":"Class", "type":"string", "jsonPath":".spec.clusterServiceClassExternalName"}, {"name":"Plan", "type":"string", "jsonPath":".spec.clusterServicePlanExternalName"}, {"name":"Status", "type":"string", "jsonPath":".status.lastConditionState"}, {"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstanceSpec {
    /// Class/plan reference; exactly one reference form must be populated
    #[serde(flatten)]
    pub plan_reference: PlanReference,
    /// Inline parameters sent to the broker
    #[serde(default)]
    #[schemars(schema_with = "crate::crd::free_form_object")]
    pub parameters: Option<serde_json::Value>,
    /// Secret keys whose JSON objects are merged into `parameters`
    #[serde(default)]
    pub parameters_from: Vec<ParametersFromSource>,
    /// Broker-facing instance id; generated when absent
    #[serde(default, rename = "externalID")]
    pub external_id: Option<String>,
    /// Incrementing this forces an update request with unchanged plan and parameters
    #[serde(default)]
    pub update_requests: i64,
}

/// The ways a user can point an instance at a class and plan
///
/// Three forms exist per scope: external names, external ids, or Kubernetes
/// object names. The class and plan halves must use the same form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlanReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_service_class_external_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_service_plan_external_name: Option<String>,
    #[serde(default, rename = "clusterServiceClassExternalID", skip_serializing_if = "Option::is_none")]
    pub cluster_service_class_external_id: Option<String>,
    #[serde(default, rename = "clusterServicePlanExternalID", skip_serializing_if = "Option::is_none")]
    pub cluster_service_plan_external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_service_class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_service_plan_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_class_external_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_plan_external_name: Option<String>,
    #[serde(default, rename = "serviceClassExternalID", skip_serializing_if = "Option::is_none")]
    pub service_class_external_id: Option<String>,
    #[serde(default, rename = "servicePlanExternalID", skip_serializing_if = "Option::is_none")]
    pub service_plan_external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_plan_name: Option<String>,
}

impl PlanReference {
    /// Reference by cluster-scoped external names
    #[must_use]
    pub fn cluster_external_names(class: &str, plan: &str) -> Self {
        Self {
            cluster_service_class_external_name: Some(class.to_string()),
            cluster_service_plan_external_name: Some(plan.to_string()),
            ..Self::default()
        }
    }

    /// Human-readable rendering used in condition messages
    #[must_use]
    pub fn describe(&self) -> String {
        let pairs = [
            ("ClusterServiceClassExternalName", &self.cluster_service_class_external_name),
            ("ClusterServicePlanExternalName", &self.cluster_service_plan_external_name),
            ("ClusterServiceClassExternalID", &self.cluster_service_class_external_id),
            ("ClusterServicePlanExternalID", &self.cluster_service_plan_external_id),
            ("ClusterServiceClassName", &self.cluster_service_class_name),
            ("ClusterServicePlanName", &self.cluster_service_plan_name),
            ("ServiceClassExternalName", &self.service_class_external_name),
            ("ServicePlanExternalName", &self.service_plan_external_name),
            ("ServiceClassExternalID", &self.service_class_external_id),
            ("ServicePlanExternalID", &self.service_plan_external_id),
            ("ServiceClassName", &self.service_class_name),
            ("ServicePlanName", &self.service_plan_name),
        ];
        let parts: Vec<String> = pairs
            .iter()
            .filter_map(|(label, value)| value.as_ref().map(|v| format!("{label}:{v:?}")))
            .collect();
        format!("{{{}}}", parts.join(", "))
    }
}

/// Status of the ServiceInstance resource
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstanceStatus {
    /// Conditions represent the latest available observations (Ready, Failed, OrphanMitigation)
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// True while the broker is completing an asynchronous operation
    #[serde(default)]
    pub async_op_in_progress: bool,
    /// True while a deprovision is cleaning up after an ambiguous provision failure
    #[serde(default)]
    pub orphan_mitigation_in_progress: bool,
    /// Operation key returned by the broker for the in-flight async operation
    #[serde(default)]
    pub last_operation: Option<String>,
    /// Operation recorded as in flight; at most one at a time
    #[serde(default)]
    pub current_operation: Option<InstanceOperation>,
    /// When the current operation was recorded (RFC3339)
    #[serde(default)]
    pub operation_start_time: Option<String>,
    /// Properties the in-flight operation will apply
    #[serde(default)]
    pub in_progress_properties: Option<InstancePropertiesState>,
    /// Properties the broker last confirmed
    #[serde(default)]
    pub external_properties: Option<InstancePropertiesState>,
    /// Catalog objects the plan reference resolved to
    #[serde(default)]
    pub resolved_references: Option<ResolvedReferences>,
    /// Broker-facing instance id in use
    #[serde(default, rename = "externalID")]
    pub external_id: Option<String>,
    /// Generation last evaluated by the controller
    #[serde(default)]
    pub observed_generation: Option<i64>,
    /// Generation last applied to the broker
    #[serde(default)]
    pub reconciled_generation: Option<i64>,
    #[serde(default)]
    pub provision_status: Option<ProvisionStatus>,
    #[serde(default)]
    pub deprovision_status: Option<DeleteStatus>,
    #[serde(default, rename = "dashboardURL")]
    pub dashboard_url: Option<String>,
    /// Reason of the latest Ready condition, for printing
    #[serde(default)]
    pub last_condition_state: Option<String>,
    /// `spec.updateRequests` value last acted upon
    #[serde(default)]
    pub observed_update_requests: Option<i64>,
}

/// Plan and parameters applied (or being applied) on the broker
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstancePropertiesState {
    #[serde(default)]
    pub class_external_name: Option<String>,
    #[serde(default, rename = "classExternalID")]
    pub class_external_id: Option<String>,
    #[serde(default)]
    pub plan_external_name: Option<String>,
    #[serde(default, rename = "planExternalID")]
    pub plan_external_id: Option<String>,
    /// Parameters with secret-sourced values redacted
    #[serde(default)]
    #[schemars(schema_with = "crate::crd::free_form_object")]
    pub parameters: Option<serde_json::Value>,
    /// SHA-256 of the full resolved parameters
    #[serde(default)]
    pub parameter_checksum: Option<String>,
}

/// Catalog objects a plan reference resolved to
///
/// Kept in status so deprovisioning still knows the broker after the catalog
/// entry disappears.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedReferences {
    pub scope: ReferenceScope,
    pub class_name: String,
    pub plan_name: String,
    pub broker_name: String,
}
