//! # Parameter Sources
//!
//! Types for inline parameters and `parametersFrom` secret references, shared by
//! instances and bindings.

use schemars::{json_schema, Schema, SchemaGenerator};
use serde::{Deserialize, Serialize};

/// Source of parameters for a broker request
///
/// Exactly one source must be set; today the only source is a secret key.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ParametersFromSource {
    /// Secret key holding a JSON object of parameters
    #[serde(default)]
    pub secret_key_ref: Option<SecretKeyReference>,
}

/// Reference to a key in a secret in the resource namespace
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyReference {
    /// Name of the secret
    pub name: String,
    /// Key within the secret data
    pub key: String,
}

/// Schema for free-form JSON parameter objects
///
/// Structural CRD schemas reject untyped fields unless they opt out of pruning.
pub fn free_form_object(_gen: &mut SchemaGenerator) -> Schema {
    json_schema!({
        "type": "object",
        "x-kubernetes-preserve-unknown-fields": true,
        "nullable": true
    })
}
