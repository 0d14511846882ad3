//! # Controller
//!
//! Core controller modules for the Service Catalog Controller.
//!
//! - `backoff`: exponential backoff for retries and async polling
//! - `parameters`: builds broker parameters from inline values and secrets
//! - `reconciler`: instance and binding state machines
//! - `server`: HTTP server for metrics and health checks
//! - `transform`: secret transforms applied to bind credentials

pub mod backoff;
pub mod parameters;
pub mod reconciler;
pub mod server;
pub mod transform;
