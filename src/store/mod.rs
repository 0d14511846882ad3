//! # Stores
//!
//! Seams between the state machines and the Kubernetes objects they read or
//! write besides their own resource.
//!
//! - `secrets`: parameter sources, transform sources and binding result secrets
//! - `instances`: the instance a binding references

mod instances;
mod secrets;

pub use instances::{InMemoryInstanceStore, InstanceLookup, KubeInstanceLookup};
pub use secrets::{InMemorySecretStore, KubeSecretStore, SecretData, SecretStore};

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Kubernetes API error: {0}")]
    Api(String),
    /// A secret with the target name exists and belongs to something else
    #[error("secret {namespace}/{name} exists and is not owned by this binding")]
    NotOwned { namespace: String, name: String },
}
