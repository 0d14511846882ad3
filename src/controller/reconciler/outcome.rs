//! # Reconciliation Outcome
//!
//! A state machine pass never writes to Kubernetes itself. It returns the status
//! it wants persisted, the finalizer change, and when it wants to run again; the
//! runtime applies them.

use crate::controller::reconciler::types::TriggerSource;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizerChange {
    Unchanged,
    Add,
    /// Cleanup finished; the object may go away
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// Wait for the next change event
    AwaitChange,
    After(Duration, TriggerSource),
}

impl Requeue {
    #[must_use]
    pub fn now(trigger: TriggerSource) -> Self {
        Requeue::After(Duration::ZERO, trigger)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Outcome<S> {
    /// New status; `None` when nothing changed
    pub status: Option<S>,
    pub finalizer: FinalizerChange,
    pub requeue: Requeue,
}

impl<S> Outcome<S> {
    #[must_use]
    pub fn status_changed(&self) -> bool {
        self.status.is_some()
    }
}

/// Result of a step that may end the pass early
#[derive(Debug)]
pub(crate) enum Flow<T> {
    Next(T),
    Stop(Requeue),
}

/// Working state of one pass over a resource
#[derive(Debug, Clone)]
pub(crate) struct Pass<S> {
    original: S,
    pub(crate) status: S,
    pub(crate) finalizer: FinalizerChange,
}

impl<S: Clone + PartialEq> Pass<S> {
    pub(crate) fn new(original: S) -> Self {
        Self {
            status: original.clone(),
            original,
            finalizer: FinalizerChange::Unchanged,
        }
    }

    pub(crate) fn finish(self, requeue: Requeue) -> Outcome<S> {
        let status = (self.status != self.original).then_some(self.status);
        Outcome {
            status,
            finalizer: self.finalizer,
            requeue,
        }
    }
}
