//! # Prelude
//!
//! Re-exports the types most callers need.
//!
//! ```rust
//! use service_catalog_controller::prelude::*;
//! ```

pub use crate::crd::*;

pub use crate::broker::{BrokerClient, BrokerError, BrokerErrorClass, BrokerRegistry};
pub use crate::catalog::{CatalogLookup, CatalogScope};
pub use crate::store::{InstanceLookup, SecretData, SecretStore};

pub use crate::controller::reconciler::{
    reconcile_binding, reconcile_instance, BackoffState, FinalizerChange, Outcome, Reconciler,
    ReconcilerError, Requeue, TriggerSource,
};

pub use crate::config::{
    ControllerConfig, ServerConfig, SharedControllerConfig, SharedServerConfig,
};
