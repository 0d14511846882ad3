//! # Broker Registry
//!
//! Resolves the broker a catalog entry belongs to into a ready `BrokerClient`.
//! The Kubernetes implementation reads the broker resource and its auth secret on
//! every call, so rotated credentials are picked up without a restart.

use crate::broker::{BrokerAuth, BrokerClient, BrokerError, OsbClient};
use crate::crd::{
    ClusterServiceBroker, CommonServiceBrokerSpec, ReferenceScope, SecretReference, ServiceBroker,
};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Identifies a broker resource
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BrokerRef {
    pub scope: ReferenceScope,
    pub name: String,
    /// Namespace of a namespaced broker; `None` for cluster brokers
    pub namespace: Option<String>,
}

impl BrokerRef {
    #[must_use]
    pub fn cluster(name: &str) -> Self {
        Self {
            scope: ReferenceScope::Cluster,
            name: name.to_string(),
            namespace: None,
        }
    }

    #[must_use]
    pub fn namespaced(namespace: &str, name: &str) -> Self {
        Self {
            scope: ReferenceScope::Namespaced,
            name: name.to_string(),
            namespace: Some(namespace.to_string()),
        }
    }
}

impl std::fmt::Display for BrokerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}/{}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

#[async_trait]
pub trait BrokerRegistry: Send + Sync {
    /// Client for the referenced broker
    ///
    /// A missing broker yields `BrokerError::UnknownBroker`, which is retriable.
    async fn client_for(&self, broker: &BrokerRef) -> Result<Arc<dyn BrokerClient>, BrokerError>;
}

/// Registry backed by the Kubernetes API
pub struct KubeBrokerRegistry {
    client: Client,
    secure_http: reqwest::Client,
    insecure_http: reqwest::Client,
}

impl std::fmt::Debug for KubeBrokerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeBrokerRegistry").finish_non_exhaustive()
    }
}

impl KubeBrokerRegistry {
    /// # Errors
    /// Returns an error if the HTTP clients cannot be built
    pub fn new(client: Client, request_timeout: Duration) -> Result<Self, BrokerError> {
        Ok(Self {
            client,
            secure_http: OsbClient::http_client(request_timeout, false)?,
            insecure_http: OsbClient::http_client(request_timeout, true)?,
        })
    }

    async fn broker_spec(
        &self,
        broker: &BrokerRef,
    ) -> Result<(CommonServiceBrokerSpec, Option<String>), BrokerError> {
        match (&broker.scope, &broker.namespace) {
            (ReferenceScope::Namespaced, Some(namespace)) => {
                let api: Api<ServiceBroker> = Api::namespaced(self.client.clone(), namespace);
                let found = api
                    .get_opt(&broker.name)
                    .await
                    .map_err(|e| BrokerError::Transport(e.to_string()))?
                    .ok_or_else(|| BrokerError::UnknownBroker(broker.to_string()))?;
                Ok((found.spec.common, Some(namespace.clone())))
            }
            (ReferenceScope::Namespaced, None) => Err(BrokerError::Config(format!(
                "namespaced broker {} has no namespace",
                broker.name
            ))),
            (ReferenceScope::Cluster, _) => {
                let api: Api<ClusterServiceBroker> = Api::all(self.client.clone());
                let found = api
                    .get_opt(&broker.name)
                    .await
                    .map_err(|e| BrokerError::Transport(e.to_string()))?
                    .ok_or_else(|| BrokerError::UnknownBroker(broker.to_string()))?;
                Ok((found.spec.common, None))
            }
        }
    }

    /// Read one key of an auth secret as UTF-8
    async fn secret_value(
        &self,
        reference: &SecretReference,
        broker_namespace: Option<&str>,
        key: &str,
    ) -> Result<String, BrokerError> {
        let namespace = broker_namespace
            .or(reference.namespace.as_deref())
            .ok_or_else(|| {
                BrokerError::Config(format!("auth secret {} has no namespace", reference.name))
            })?;
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api
            .get_opt(&reference.name)
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?
            .ok_or_else(|| {
                BrokerError::Config(format!(
                    "auth secret {namespace}/{} not found",
                    reference.name
                ))
            })?;
        let bytes = secret
            .data
            .as_ref()
            .and_then(|data| data.get(key))
            .ok_or_else(|| {
                BrokerError::Config(format!(
                    "auth secret {namespace}/{} has no key {key}",
                    reference.name
                ))
            })?;
        String::from_utf8(bytes.0.clone()).map_err(|e| {
            BrokerError::Config(format!(
                "auth secret {namespace}/{} key {key} is not UTF-8: {e}",
                reference.name
            ))
        })
    }

    async fn auth_for(
        &self,
        spec: &CommonServiceBrokerSpec,
        broker_namespace: Option<&str>,
    ) -> Result<Option<BrokerAuth>, BrokerError> {
        let Some(auth_info) = &spec.auth_info else {
            return Ok(None);
        };
        if let Some(basic) = &auth_info.basic {
            let username = self
                .secret_value(&basic.secret_ref, broker_namespace, "username")
                .await?;
            let password = self
                .secret_value(&basic.secret_ref, broker_namespace, "password")
                .await?;
            return Ok(Some(BrokerAuth::Basic { username, password }));
        }
        if let Some(bearer) = &auth_info.bearer {
            let token = self
                .secret_value(&bearer.secret_ref, broker_namespace, "token")
                .await?;
            return Ok(Some(BrokerAuth::Bearer { token }));
        }
        Ok(None)
    }
}

#[async_trait]
impl BrokerRegistry for KubeBrokerRegistry {
    async fn client_for(&self, broker: &BrokerRef) -> Result<Arc<dyn BrokerClient>, BrokerError> {
        let (spec, broker_namespace) = self.broker_spec(broker).await?;
        let auth = self.auth_for(&spec, broker_namespace.as_deref()).await?;
        let http = if spec.insecure_skip_tls_verify {
            self.insecure_http.clone()
        } else {
            self.secure_http.clone()
        };
        debug!(broker = %broker, url = spec.url.as_str(), "broker.client.resolved");
        Ok(Arc::new(OsbClient::new(&broker.name, &spec.url, auth, http)))
    }
}

/// Registry with a fixed set of clients
///
/// A registry built with `with_default` answers every lookup with that client.
#[derive(Default)]
pub struct StaticBrokerRegistry {
    clients: Mutex<HashMap<BrokerRef, Arc<dyn BrokerClient>>>,
    default: Option<Arc<dyn BrokerClient>>,
}

impl std::fmt::Debug for StaticBrokerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticBrokerRegistry")
            .field("has_default", &self.default.is_some())
            .finish_non_exhaustive()
    }
}

impl StaticBrokerRegistry {
    #[must_use]
    pub fn with_default(client: Arc<dyn BrokerClient>) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            default: Some(client),
        }
    }

    pub fn insert(&self, broker: BrokerRef, client: Arc<dyn BrokerClient>) {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(broker, client);
    }
}

#[async_trait]
impl BrokerRegistry for StaticBrokerRegistry {
    async fn client_for(&self, broker: &BrokerRef) -> Result<Arc<dyn BrokerClient>, BrokerError> {
        let found = self
            .clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(broker)
            .cloned();
        found
            .or_else(|| self.default.clone())
            .ok_or_else(|| BrokerError::UnknownBroker(broker.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::FakeBrokerClient;

    #[tokio::test]
    async fn test_static_registry_prefers_explicit_entry() {
        let fallback: Arc<dyn BrokerClient> = Arc::new(FakeBrokerClient::new());
        let registry = StaticBrokerRegistry::with_default(fallback);
        let explicit = Arc::new(FakeBrokerClient::new());
        registry.insert(BrokerRef::cluster("ups"), explicit.clone());

        let resolved = registry
            .client_for(&BrokerRef::cluster("ups"))
            .await
            .expect("broker registered");
        assert!(Arc::ptr_eq(
            &resolved,
            &(explicit as Arc<dyn BrokerClient>)
        ));
        assert!(registry
            .client_for(&BrokerRef::namespaced("team-a", "other"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_empty_registry_reports_unknown_broker() {
        let registry = StaticBrokerRegistry::default();
        let err = registry
            .client_for(&BrokerRef::namespaced("team-a", "missing"))
            .await
            .err()
            .expect("no broker registered");
        assert_eq!(err, BrokerError::UnknownBroker("team-a/missing".into()));
    }

    #[test]
    fn test_broker_ref_display() {
        assert_eq!(BrokerRef::cluster("ups").to_string(), "ups");
        assert_eq!(BrokerRef::namespaced("ns", "ups").to_string(), "ns/ups");
    }
}
