//! # Secret Transforms
//!
//! Applies `spec.secretTransforms` to the credentials a broker returned before
//! they are written to the binding's secret.
//!
//! Transforms run strictly in list order and each one sees the result of the
//! previous ones. JSONPath lookups read the original broker credentials, never
//! the working data. Missing keys are no-ops; a missing `addKeysFrom` secret
//! fails the whole pipeline.

pub mod jsonpath;

use crate::crd::{AddKeyTransform, SecretTransform};
use crate::store::{SecretData, SecretStore, StoreError};
use base64::Engine;
use jsonpath::JsonPath;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransformError {
    #[error("addKey {key:?}: value is not valid base64: {reason}")]
    InvalidBase64 { key: String, reason: String },
    #[error("addKey {key:?}: invalid JSONPath expression: {reason}")]
    InvalidJsonPath { key: String, reason: String },
    #[error("secretTransforms[{index}].addKeysFrom has no secretRef")]
    MissingSecretRef { index: usize },
    #[error("addKeysFrom secret {namespace}/{name} not found")]
    SourceSecretNotFound { namespace: String, name: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Broker credentials as secret data
///
/// String values are stored as their UTF-8 bytes; any other value is stored as
/// its JSON text.
#[must_use]
pub fn credentials_to_secret_data(credentials: &Map<String, Value>) -> SecretData {
    credentials
        .iter()
        .map(|(key, value)| {
            let bytes = match value {
                Value::String(s) => s.as_bytes().to_vec(),
                other => other.to_string().into_bytes(),
            };
            (key.clone(), bytes)
        })
        .collect()
}

fn add_key_value(
    add_key: &AddKeyTransform,
    credentials: &Value,
) -> Result<Option<Vec<u8>>, TransformError> {
    if let Some(encoded) = &add_key.value {
        return base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map(Some)
            .map_err(|e| TransformError::InvalidBase64 {
                key: add_key.key.clone(),
                reason: e.to_string(),
            });
    }
    if let Some(value) = &add_key.string_value {
        return Ok(Some(value.as_bytes().to_vec()));
    }
    if let Some(expression) = &add_key.json_path_expression {
        let path = JsonPath::parse(expression).map_err(|reason| {
            TransformError::InvalidJsonPath {
                key: add_key.key.clone(),
                reason,
            }
        })?;
        let selected = path.select(credentials);
        if selected.is_empty() {
            warn!(
                key = add_key.key.as_str(),
                expression = expression.as_str(),
                "transform.add_key.no_match"
            );
            return Ok(None);
        }
        return Ok(Some(jsonpath::render(&selected).into_bytes()));
    }
    Ok(Some(Vec::new()))
}

/// Apply `transforms` to `data` in order
///
/// # Errors
/// Malformed `addKey` values or expressions, and `addKeysFrom` secrets that
/// cannot be read, fail the pipeline.
pub async fn apply_transforms(
    data: &mut SecretData,
    credentials: &Map<String, Value>,
    transforms: &[SecretTransform],
    secrets: &dyn SecretStore,
    namespace: &str,
) -> Result<(), TransformError> {
    let document = Value::Object(credentials.clone());

    for (index, transform) in transforms.iter().enumerate() {
        if let Some(add_key) = &transform.add_key {
            if let Some(value) = add_key_value(add_key, &document)? {
                data.insert(add_key.key.clone(), value);
            }
        }

        if let Some(rename) = &transform.rename_key {
            match data.remove(&rename.from) {
                Some(value) => {
                    data.insert(rename.to.clone(), value);
                }
                None => debug!(from = rename.from.as_str(), "transform.rename_key.absent"),
            }
        }

        if let Some(add_keys_from) = &transform.add_keys_from {
            let reference = add_keys_from
                .secret_ref
                .as_ref()
                .ok_or(TransformError::MissingSecretRef { index })?;
            let source_namespace = reference.namespace.as_deref().unwrap_or(namespace);
            let source = secrets
                .get(source_namespace, &reference.name)
                .await?
                .ok_or_else(|| TransformError::SourceSecretNotFound {
                    namespace: source_namespace.to_string(),
                    name: reference.name.clone(),
                })?;
            data.extend(source);
        }

        if let Some(remove) = &transform.remove_key {
            data.remove(&remove.key);
        }
    }
    Ok(())
}
