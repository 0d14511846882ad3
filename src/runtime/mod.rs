//! # Runtime
//!
//! Wires the state machines to Kubernetes.
//!
//! - `initialization`: tracing, metrics, probe server, clients and startup reconciliation
//! - `watch_loop`: the instance and binding controllers
//! - `persist`: writes a pass's status and finalizer changes back to the API server
//! - `error_policy`: requeue decisions for failed passes and watch stream errors

pub mod error_policy;
pub mod initialization;
pub mod persist;
pub mod watch_loop;

use crate::controller::reconciler::Reconciler;
use kube::Client;

/// Context handed to both controllers
#[derive(Clone)]
pub struct ControllerContext {
    pub client: Client,
    pub reconciler: Reconciler,
}

impl std::fmt::Debug for ControllerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerContext")
            .field("reconciler", &self.reconciler)
            .finish_non_exhaustive()
    }
}
