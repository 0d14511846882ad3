//! Lookup of the instance a binding references.

use crate::crd::ServiceInstance;
use crate::store::StoreError;
use async_trait::async_trait;
use kube::{Api, Client};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

#[async_trait]
pub trait InstanceLookup: Send + Sync {
    async fn get(&self, namespace: &str, name: &str)
        -> Result<Option<ServiceInstance>, StoreError>;
}

/// Instance lookup against the Kubernetes API
#[derive(Clone)]
pub struct KubeInstanceLookup {
    client: Client,
}

impl std::fmt::Debug for KubeInstanceLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeInstanceLookup").finish_non_exhaustive()
    }
}

impl KubeInstanceLookup {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl InstanceLookup for KubeInstanceLookup {
    async fn get(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceInstance>, StoreError> {
        let api: Api<ServiceInstance> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await
            .map_err(|e| StoreError::Api(e.to_string()))
    }
}

/// Instances held in memory
#[derive(Debug, Default)]
pub struct InMemoryInstanceStore {
    instances: Mutex<HashMap<(String, String), ServiceInstance>>,
}

impl InMemoryInstanceStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an instance, keyed by its namespace and name
    pub fn insert(&self, instance: ServiceInstance) {
        let key = (
            instance.metadata.namespace.clone().unwrap_or_default(),
            instance.metadata.name.clone().unwrap_or_default(),
        );
        self.instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, instance);
    }

    pub fn remove(&self, namespace: &str, name: &str) {
        self.instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(namespace.to_string(), name.to_string()));
    }
}

#[async_trait]
impl InstanceLookup for InMemoryInstanceStore {
    async fn get(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceInstance>, StoreError> {
        Ok(self
            .instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }
}
