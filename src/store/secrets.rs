//! # Secret Store
//!
//! Reads parameter and transform source secrets and writes binding result secrets.

use crate::constants::FIELD_MANAGER;
use crate::store::StoreError;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::ByteString;
use kube::api::{DeleteParams, Patch, PatchParams};
use kube::{Api, Client};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// Decoded secret data: key to raw bytes
pub type SecretData = BTreeMap<String, Vec<u8>>;

#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Data of a secret, or `None` if it does not exist
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<SecretData>, StoreError>;

    /// Create or replace a secret's data
    ///
    /// With an `owner`, an existing secret not controlled by that owner is left
    /// untouched and `StoreError::NotOwned` is returned.
    async fn put(
        &self,
        namespace: &str,
        name: &str,
        data: SecretData,
        owner: Option<OwnerReference>,
    ) -> Result<(), StoreError>;

    /// Delete a secret; deleting a missing secret succeeds
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError>;
}

fn controlled_by(owner_references: Option<&Vec<OwnerReference>>, owner: &OwnerReference) -> bool {
    owner_references
        .into_iter()
        .flatten()
        .any(|existing| existing.uid == owner.uid && existing.controller == Some(true))
}

/// Secret store backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeSecretStore {
    client: Client,
}

impl std::fmt::Debug for KubeSecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeSecretStore").finish_non_exhaustive()
    }
}

impl KubeSecretStore {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<SecretData>, StoreError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api
            .get_opt(name)
            .await
            .map_err(|e| StoreError::Api(e.to_string()))?;
        Ok(secret.map(|secret| {
            secret
                .data
                .unwrap_or_default()
                .into_iter()
                .map(|(key, value)| (key, value.0))
                .collect()
        }))
    }

    async fn put(
        &self,
        namespace: &str,
        name: &str,
        data: SecretData,
        owner: Option<OwnerReference>,
    ) -> Result<(), StoreError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        if let Some(owner) = &owner {
            let existing = api
                .get_opt(name)
                .await
                .map_err(|e| StoreError::Api(e.to_string()))?;
            if let Some(existing) = existing {
                if !controlled_by(existing.metadata.owner_references.as_ref(), owner) {
                    return Err(StoreError::NotOwned {
                        namespace: namespace.to_string(),
                        name: name.to_string(),
                    });
                }
            }
        }

        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                owner_references: owner.map(|owner| vec![owner]),
                ..ObjectMeta::default()
            },
            data: Some(
                data.into_iter()
                    .map(|(key, value)| (key, ByteString(value)))
                    .collect(),
            ),
            type_: Some("Opaque".to_string()),
            ..Secret::default()
        };
        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(name, &params, &Patch::Apply(&secret))
            .await
            .map_err(|e| StoreError::Api(e.to_string()))?;
        debug!(secret.namespace = namespace, secret.name = name, "secret.applied");
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(api_err)) if api_err.code == 404 => Ok(()),
            Err(e) => Err(StoreError::Api(e.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct StoredSecret {
    data: SecretData,
    owner: Option<OwnerReference>,
}

/// Secret store held in memory
#[derive(Debug, Default)]
pub struct InMemorySecretStore {
    secrets: Mutex<HashMap<(String, String), StoredSecret>>,
}

impl InMemorySecretStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a secret that is not owned by anything
    pub fn insert(&self, namespace: &str, name: &str, data: SecretData) {
        self.secrets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                (namespace.to_string(), name.to_string()),
                StoredSecret { data, owner: None },
            );
    }

    /// Seed a secret from string values
    pub fn insert_strings(&self, namespace: &str, name: &str, data: &[(&str, &str)]) {
        self.insert(
            namespace,
            name,
            data.iter()
                .map(|(key, value)| ((*key).to_string(), value.as_bytes().to_vec()))
                .collect(),
        );
    }

    /// Current data of a secret
    #[must_use]
    pub fn data(&self, namespace: &str, name: &str) -> Option<SecretData> {
        self.secrets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(namespace.to_string(), name.to_string()))
            .map(|stored| stored.data.clone())
    }

    /// Owner recorded when the secret was last written
    #[must_use]
    pub fn owner(&self, namespace: &str, name: &str) -> Option<OwnerReference> {
        self.secrets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(namespace.to_string(), name.to_string()))
            .and_then(|stored| stored.owner.clone())
    }

    #[must_use]
    pub fn contains(&self, namespace: &str, name: &str) -> bool {
        self.data(namespace, name).is_some()
    }
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<SecretData>, StoreError> {
        Ok(self.data(namespace, name))
    }

    async fn put(
        &self,
        namespace: &str,
        name: &str,
        data: SecretData,
        owner: Option<OwnerReference>,
    ) -> Result<(), StoreError> {
        let mut secrets = self.secrets.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (namespace.to_string(), name.to_string());
        if let (Some(existing), Some(owner)) = (secrets.get(&key), owner.as_ref()) {
            let existing_owners = existing.owner.clone().map(|o| vec![o]);
            if !controlled_by(existing_owners.as_ref(), owner) {
                return Err(StoreError::NotOwned {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                });
            }
        }
        secrets.insert(key, StoredSecret { data, owner });
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.secrets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(uid: &str) -> OwnerReference {
        OwnerReference {
            api_version: "servicecatalog.k8s.io/v1beta1".into(),
            kind: "ServiceBinding".into(),
            name: "binding".into(),
            uid: uid.into(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    #[tokio::test]
    async fn test_put_refuses_to_overwrite_foreign_secret() {
        let store = InMemorySecretStore::new();
        store.insert_strings("ns", "creds", &[("user", "someone-else")]);

        let err = store
            .put("ns", "creds", SecretData::new(), Some(owner("uid-1")))
            .await
            .expect_err("secret is not ours");
        assert_eq!(
            err,
            StoreError::NotOwned {
                namespace: "ns".into(),
                name: "creds".into()
            }
        );
        assert_eq!(
            store.data("ns", "creds").and_then(|d| d.get("user").cloned()),
            Some(b"someone-else".to_vec())
        );
    }

    #[tokio::test]
    async fn test_put_overwrites_own_secret_and_delete_is_idempotent() {
        let store = InMemorySecretStore::new();
        let mut data = SecretData::new();
        data.insert("k".into(), b"v1".to_vec());
        store
            .put("ns", "creds", data.clone(), Some(owner("uid-1")))
            .await
            .expect("first write");
        data.insert("k".into(), b"v2".to_vec());
        store
            .put("ns", "creds", data, Some(owner("uid-1")))
            .await
            .expect("owner may overwrite");
        assert_eq!(
            store.data("ns", "creds").and_then(|d| d.get("k").cloned()),
            Some(b"v2".to_vec())
        );

        store.delete("ns", "creds").await.expect("delete");
        store.delete("ns", "creds").await.expect("second delete");
        assert!(!store.contains("ns", "creds"));
    }
}
