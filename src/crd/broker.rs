//! # Broker Resources
//!
//! `ClusterServiceBroker` and `ServiceBroker` describe where a broker lives and
//! how to authenticate against it. Access to the referenced auth secrets is
//! checked at admission time, before the controller ever reads them.

use serde::{Deserialize, Serialize};

/// Fields shared by cluster-scoped and namespaced brokers
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CommonServiceBrokerSpec {
    /// Base URL of the broker, e.g. `https://broker.example.com`
    pub url: String,
    /// Skip TLS verification of the broker endpoint
    #[serde(default, rename = "insecureSkipTLSVerify")]
    pub insecure_skip_tls_verify: bool,
    #[serde(default)]
    pub auth_info: Option<BrokerAuthInfo>,
}

/// Broker authentication; at most one of `basic` and `bearer` is set
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BrokerAuthInfo {
    /// Secret with `username` and `password` keys
    #[serde(default)]
    pub basic: Option<SecretAuthConfig>,
    /// Secret with a `token` key
    #[serde(default)]
    pub bearer: Option<SecretAuthConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretAuthConfig {
    pub secret_ref: SecretReference,
}

/// Secret reference; namespaced brokers ignore `namespace` and use their own
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
pub struct SecretReference {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
}

/// Cluster-scoped broker
#[derive(kube::CustomResource, Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "ClusterServiceBroker",
    group = "servicecatalog.k8s.io",
    version = "v1beta1",
    shortname = "csb",
    printcolumn = r#"{"name":"URL", "type":"string", "jsonPath":".spec.url"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterServiceBrokerSpec {
    #[serde(flatten)]
    pub common: CommonServiceBrokerSpec,
}

/// Namespaced broker
#[derive(kube::CustomResource, Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "ServiceBroker",
    group = "servicecatalog.k8s.io",
    version = "v1beta1",
    namespaced,
    shortname = "sb",
    printcolumn = r#"{"name":"URL", "type":"string", "jsonPath":".spec.url"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBrokerSpec {
    #[serde(flatten)]
    pub common: CommonServiceBrokerSpec,
}
