//! # Shared Status Types
//!
//! Condition and lifecycle enums shared by `ServiceInstance` and `ServiceBinding` status.

use serde::{Deserialize, Serialize};

/// Condition represents a condition of a resource
///
/// `type` and `status` stay plain strings on the wire so conditions written by
/// other tooling round-trip untouched.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (Ready, Failed, OrphanMitigation)
    pub r#type: String,
    /// Status of the condition (True, False, Unknown)
    pub status: String,
    /// Last time the status of this condition changed (RFC3339)
    #[serde(default)]
    pub last_transition_time: Option<String>,
    /// Symbolic reason code matched on by external tooling
    #[serde(default)]
    pub reason: Option<String>,
    /// Human-readable message
    #[serde(default)]
    pub message: Option<String>,
}

/// Whether a catalog reference points at cluster-scoped or namespaced entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, schemars::JsonSchema)]
pub enum ReferenceScope {
    Cluster,
    Namespaced,
}

/// Whether the broker-side resource must be deleted when the Kubernetes object goes away
///
/// Used as `deprovisionStatus` on instances and `unbindStatus` on bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
pub enum DeleteStatus {
    /// No broker request was ever issued
    NotRequired,
    /// A broker request was issued; the broker resource may exist
    Required,
    /// The broker confirmed the resource is gone
    Succeeded,
    /// The broker refused the delete with a terminal error
    Failed,
}

/// Provisioning outcome recorded on the instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
pub enum ProvisionStatus {
    Provisioned,
    NotProvisioned,
}

/// Operation currently running against the broker for an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
pub enum InstanceOperation {
    Provision,
    Update,
    Deprovision,
}

/// Operation currently running against the broker for a binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
pub enum BindingOperation {
    Bind,
    Unbind,
}
