//! # Secret Transforms
//!
//! Wire types for `ServiceBinding.spec.secretTransforms`. Each entry sets exactly
//! one of its fields; the controller converts them into pipeline steps.

use serde::{Deserialize, Serialize};

/// A single mutation applied to the broker credentials before they are stored
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretTransform {
    #[serde(default)]
    pub add_key: Option<AddKeyTransform>,
    #[serde(default)]
    pub rename_key: Option<RenameKeyTransform>,
    #[serde(default)]
    pub add_keys_from: Option<AddKeysFromTransform>,
    #[serde(default)]
    pub remove_key: Option<RemoveKeyTransform>,
}

/// Adds (or overwrites) a key
///
/// Exactly one of `value`, `stringValue` or `jsonPathExpression` is used, in that
/// order of precedence.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AddKeyTransform {
    pub key: String,
    /// Base64-encoded bytes
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub string_value: Option<String>,
    /// JSONPath evaluated against the credentials returned by the broker, e.g. `{.host}`
    #[serde(default, rename = "jsonPathExpression")]
    pub json_path_expression: Option<String>,
}

/// Renames a key; no-op when `from` is absent
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RenameKeyTransform {
    pub from: String,
    pub to: String,
}

/// Merges every key of another secret into the credentials
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AddKeysFromTransform {
    #[serde(default)]
    pub secret_ref: Option<ObjectReference>,
}

/// Removes a key; no-op when absent
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RemoveKeyTransform {
    pub key: String,
}

/// Namespaced object reference
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    pub name: String,
    /// Defaults to the binding namespace
    #[serde(default)]
    pub namespace: Option<String>,
}
