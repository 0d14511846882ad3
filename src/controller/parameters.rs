//! # Parameter Resolution
//!
//! Builds the parameter object sent to the broker from a resource's inline
//! `parameters` and its `parametersFrom` secret keys.
//!
//! Sources are applied in order, starting from the inline object; each secret
//! key must hold a JSON object whose top-level keys are merged in, later sources
//! winning on collision. Resolution yields a complete bag or fails as a whole.
//!
//! Alongside the parameters, a redacted copy (secret-sourced values replaced by
//! `<redacted>`) is produced for status, and a SHA-256 checksum of the full
//! parameters is produced for change detection.

use crate::crd::ParametersFromSource;
use crate::store::{SecretStore, StoreError};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use thiserror::Error;

/// Placeholder written to status for values taken from secrets
pub const REDACTED_VALUE: &str = "<redacted>";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParameterError {
    #[error("inline parameters must be a JSON object")]
    InlineNotObject,
    #[error("parametersFrom[{index}] does not name a source")]
    MissingSource { index: usize },
    #[error("secret {namespace}/{name} not found")]
    SecretNotFound { namespace: String, name: String },
    #[error("secret {namespace}/{name} has no data")]
    EmptySecretData { namespace: String, name: String },
    #[error("secret {namespace}/{name} has no key {key:?}")]
    SecretKeyNotFound {
        namespace: String,
        name: String,
        key: String,
    },
    #[error("secret {name} key {key:?} is not valid JSON: {reason}")]
    MalformedJson {
        name: String,
        key: String,
        reason: String,
    },
    #[error("secret {name} key {key:?} does not hold a JSON object")]
    NotAnObject { name: String, key: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of resolving a resource's parameters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedParameters {
    /// Parameters sent to the broker
    pub parameters: Map<String, Value>,
    /// The same keys with secret-sourced values redacted
    pub redacted: Map<String, Value>,
    /// SHA-256 of `parameters`; `None` when there are no parameters
    pub checksum: Option<String>,
}

impl ResolvedParameters {
    /// Parameters for a broker request; an empty bag sends none
    #[must_use]
    pub fn for_request(&self) -> Option<Map<String, Value>> {
        (!self.parameters.is_empty()).then(|| self.parameters.clone())
    }

    /// Redacted parameters for status
    #[must_use]
    pub fn for_status(&self) -> Option<Value> {
        (!self.redacted.is_empty()).then(|| Value::Object(self.redacted.clone()))
    }
}

/// Resolve inline parameters and `parametersFrom` sources into one bag
///
/// # Errors
/// A `ParameterError` describing the first source that could not be used.
pub async fn resolve_parameters(
    inline: Option<&Value>,
    sources: &[ParametersFromSource],
    secrets: &dyn SecretStore,
    namespace: &str,
) -> Result<ResolvedParameters, ParameterError> {
    let mut parameters = match inline {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(_) => return Err(ParameterError::InlineNotObject),
    };
    let mut redacted = parameters.clone();

    for (index, source) in sources.iter().enumerate() {
        let reference = source
            .secret_key_ref
            .as_ref()
            .ok_or(ParameterError::MissingSource { index })?;
        let data = secrets
            .get(namespace, &reference.name)
            .await?
            .ok_or_else(|| ParameterError::SecretNotFound {
                namespace: namespace.to_string(),
                name: reference.name.clone(),
            })?;
        if data.is_empty() {
            return Err(ParameterError::EmptySecretData {
                namespace: namespace.to_string(),
                name: reference.name.clone(),
            });
        }
        let raw = data
            .get(&reference.key)
            .ok_or_else(|| ParameterError::SecretKeyNotFound {
                namespace: namespace.to_string(),
                name: reference.name.clone(),
                key: reference.key.clone(),
            })?;
        let value: Value =
            serde_json::from_slice(raw).map_err(|e| ParameterError::MalformedJson {
                name: reference.name.clone(),
                key: reference.key.clone(),
                reason: e.to_string(),
            })?;
        let Value::Object(object) = value else {
            return Err(ParameterError::NotAnObject {
                name: reference.name.clone(),
                key: reference.key.clone(),
            });
        };
        for (key, value) in object {
            redacted.insert(key.clone(), Value::String(REDACTED_VALUE.to_string()));
            parameters.insert(key, value);
        }
    }

    let checksum = parameter_checksum(&parameters);
    Ok(ResolvedParameters {
        parameters,
        redacted,
        checksum,
    })
}

/// SHA-256 hex digest of the parameters in canonical (sorted-key) form
#[must_use]
pub fn parameter_checksum(parameters: &Map<String, Value>) -> Option<String> {
    if parameters.is_empty() {
        return None;
    }
    let canonical = canonicalize(&Value::Object(parameters.clone()));
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    Some(digest.iter().map(|b| format!("{b:02x}")).collect())
}

/// Rebuild objects through a `BTreeMap` so key order never affects the checksum
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
            Value::Object(
                sorted
                    .into_iter()
                    .map(|(k, v)| (k.clone(), v))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::SecretKeyReference;
    use crate::store::{InMemorySecretStore, SecretData};
    use serde_json::json;

    fn from_secret(name: &str, key: &str) -> ParametersFromSource {
        ParametersFromSource {
            secret_key_ref: Some(SecretKeyReference {
                name: name.into(),
                key: key.into(),
            }),
        }
    }

    #[tokio::test]
    async fn test_nothing_to_resolve_yields_empty_bag() {
        let store = InMemorySecretStore::new();
        let resolved = resolve_parameters(None, &[], &store, "ns")
            .await
            .expect("empty is fine");
        assert!(resolved.parameters.is_empty());
        assert_eq!(resolved.checksum, None);
        assert_eq!(resolved.for_request(), None);
    }

    #[tokio::test]
    async fn test_later_sources_win_and_values_are_redacted() {
        let store = InMemorySecretStore::new();
        store.insert_strings("ns", "first", &[("p", r#"{"a": 1, "b": 2}"#)]);
        store.insert_strings("ns", "second", &[("p", r#"{"b": 3}"#)]);
        let inline = json!({"a": 0, "c": "inline"});

        let resolved = resolve_parameters(
            Some(&inline),
            &[from_secret("first", "p"), from_secret("second", "p")],
            &store,
            "ns",
        )
        .await
        .expect("resolves");

        assert_eq!(
            Value::Object(resolved.parameters.clone()),
            json!({"a": 1, "b": 3, "c": "inline"})
        );
        assert_eq!(
            resolved.for_status(),
            Some(json!({"a": "<redacted>", "b": "<redacted>", "c": "inline"}))
        );
        assert!(resolved.checksum.is_some());
    }

    #[tokio::test]
    async fn test_empty_object_in_secret_adds_nothing() {
        let store = InMemorySecretStore::new();
        store.insert_strings("ns", "params", &[("p", "{}")]);
        let resolved = resolve_parameters(None, &[from_secret("params", "p")], &store, "ns")
            .await
            .expect("empty object is fine");
        assert!(resolved.parameters.is_empty());
    }

    #[tokio::test]
    async fn test_resolution_errors_are_distinguished() {
        let store = InMemorySecretStore::new();
        store.insert_strings("ns", "params", &[("p", "{not json")]);
        store.insert_strings("ns", "list", &[("p", "[1, 2]")]);
        store.insert("ns", "empty", SecretData::default());

        let missing_secret = resolve_parameters(None, &[from_secret("nope", "p")], &store, "ns").await;
        assert!(matches!(missing_secret, Err(ParameterError::SecretNotFound { .. })));

        let missing_key = resolve_parameters(None, &[from_secret("params", "q")], &store, "ns").await;
        assert!(matches!(missing_key, Err(ParameterError::SecretKeyNotFound { .. })));

        let empty = resolve_parameters(None, &[from_secret("empty", "p")], &store, "ns").await;
        assert!(matches!(empty, Err(ParameterError::EmptySecretData { .. })));

        let malformed = resolve_parameters(None, &[from_secret("params", "p")], &store, "ns").await;
        assert!(matches!(malformed, Err(ParameterError::MalformedJson { .. })));

        let not_object = resolve_parameters(None, &[from_secret("list", "p")], &store, "ns").await;
        assert!(matches!(not_object, Err(ParameterError::NotAnObject { .. })));

        let inline = json!("scalar");
        let bad_inline = resolve_parameters(Some(&inline), &[], &store, "ns").await;
        assert_eq!(bad_inline, Err(ParameterError::InlineNotObject));
    }

    #[test]
    fn test_checksum_ignores_key_order() {
        let first = json!({"a": 1, "nested": {"x": 1, "y": 2}});
        let second = json!({"nested": {"y": 2, "x": 1}, "a": 1});
        let (Value::Object(first), Value::Object(second)) = (first, second) else {
            unreachable!("literals are objects");
        };
        assert_eq!(parameter_checksum(&first), parameter_checksum(&second));

        let mut changed = first.clone();
        changed.insert("a".into(), json!(2));
        assert_ne!(parameter_checksum(&first), parameter_checksum(&changed));
    }
}
