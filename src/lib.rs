//! Service Catalog Controller Library
//!
//! Reconciles `ServiceInstance` and `ServiceBinding` resources against Open
//! Service Brokers: provisions and deprovisions instances, binds and unbinds,
//! and injects binding credentials into Kubernetes Secrets.
//!
//! ## Quick Start
//!
//! ```rust
//! use service_catalog_controller::prelude::*;
//! ```

pub mod broker;
pub mod catalog;
pub mod config;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod observability;
pub mod prelude;
pub mod runtime;
pub mod store;
