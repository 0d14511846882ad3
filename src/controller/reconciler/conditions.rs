//! # Conditions
//!
//! Condition bookkeeping for instance and binding status.
//!
//! Exactly one condition per type is kept. `lastTransitionTime` moves only when a
//! condition's status flips, so re-applying the same observation never changes
//! status. The state machines read their current lifecycle state back from the
//! condition list through [`lifecycle_state`].

use crate::crd::{Condition, ServiceBindingStatus, ServiceInstanceStatus};

/// Reason codes written to conditions
///
/// External tooling matches on these strings.
pub mod reasons {
    pub const PROVISION_REQUEST_IN_FLIGHT: &str = "ProvisionRequestInFlight";
    pub const PROVISIONING: &str = "Provisioning";
    pub const PROVISIONED_SUCCESSFULLY: &str = "ProvisionedSuccessfully";
    pub const PROVISION_CALL_FAILED: &str = "ProvisionCallFailed";
    pub const UPDATE_REQUEST_IN_FLIGHT: &str = "UpdateInstanceRequestInFlight";
    pub const UPDATING: &str = "UpdatingInstance";
    pub const UPDATED_SUCCESSFULLY: &str = "InstanceUpdatedSuccessfully";
    pub const UPDATE_CALL_FAILED: &str = "UpdateInstanceCallFailed";
    pub const DEPROVISION_REQUEST_IN_FLIGHT: &str = "DeprovisionRequestInFlight";
    pub const DEPROVISIONING: &str = "Deprovisioning";
    pub const DEPROVISIONED_SUCCESSFULLY: &str = "DeprovisionedSuccessfully";
    pub const DEPROVISION_CALL_FAILED: &str = "DeprovisionCallFailed";

    pub const BIND_REQUEST_IN_FLIGHT: &str = "BindRequestInFlight";
    pub const BINDING: &str = "Binding";
    pub const INJECTED_BIND_RESULT: &str = "InjectedBindResult";
    pub const BIND_CALL_FAILED: &str = "BindCallFailed";
    pub const ERROR_FETCHING_BINDING: &str = "ErrorFetchingBinding";
    pub const ERROR_INJECTING_BIND_RESULT: &str = "ErrorInjectingBindResult";
    pub const UNBIND_REQUEST_IN_FLIGHT: &str = "UnbindRequestInFlight";
    pub const UNBINDING: &str = "Unbinding";
    pub const UNBOUND_SUCCESSFULLY: &str = "UnboundSuccessfully";
    pub const UNBIND_CALL_FAILED: &str = "UnbindCallFailed";

    pub const ERROR_NONEXISTENT_INSTANCE: &str = "ErrorNonexistentInstance";
    pub const ERROR_INSTANCE_NOT_READY: &str = "ErrorInstanceNotReady";
    pub const ERROR_NONBINDABLE_SERVICE_CLASS: &str = "ErrorNonbindableServiceClass";
    pub const ERROR_WITH_PARAMETERS: &str = "ErrorWithParameters";
    pub const ERROR_NON_UPDATABLE_PLAN: &str = "ErrorNonUpdatablePlan";
    pub const ERROR_INVALID_PLAN_REFERENCE: &str = "ErrorInvalidPlanReference";
    pub const REFERENCES_NONEXISTENT_SERVICE_CLASS: &str = "ReferencesNonexistentServiceClass";
    pub const REFERENCES_NONEXISTENT_SERVICE_PLAN: &str = "ReferencesNonexistentServicePlan";
    pub const REFERENCES_NONEXISTENT_BROKER: &str = "ReferencesNonexistentBroker";
    pub const ERROR_GETTING_BROKER_CLIENT: &str = "ErrorGettingBrokerClient";
    pub const ERROR_POLLING_LAST_OPERATION: &str = "ErrorPollingLastOperation";
    pub const ERROR_RECONCILIATION_RETRY_TIMEOUT: &str = "ErrorReconciliationRetryTimeout";

    pub const STARTING_ORPHAN_MITIGATION: &str = "StartingOrphanMitigation";
    pub const ORPHAN_MITIGATION_SUCCESSFUL: &str = "OrphanMitigationSuccessful";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionType {
    Ready,
    Failed,
    OrphanMitigation,
}

impl ConditionType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionType::Ready => "Ready",
            ConditionType::Failed => "Failed",
            ConditionType::OrphanMitigation => "OrphanMitigation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl ConditionStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        }
    }
}

/// Logical state reduced from a condition list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// No Ready condition yet
    New,
    /// Ready=False without a failure
    InProgress,
    Ready,
    /// An orphan mitigation is running
    OrphanMitigation,
    /// Failed=True; waits for a spec change
    Failed,
}

impl LifecycleState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::New => "new",
            LifecycleState::InProgress => "in-progress",
            LifecycleState::Ready => "ready",
            LifecycleState::OrphanMitigation => "orphan-mitigation",
            LifecycleState::Failed => "failed",
        }
    }
}

#[must_use]
pub fn find_condition(conditions: &[Condition], kind: ConditionType) -> Option<&Condition> {
    conditions.iter().find(|c| c.r#type == kind.as_str())
}

#[must_use]
pub fn is_true(conditions: &[Condition], kind: ConditionType) -> bool {
    find_condition(conditions, kind).is_some_and(|c| c.status == ConditionStatus::True.as_str())
}

#[must_use]
pub fn lifecycle_state(conditions: &[Condition]) -> LifecycleState {
    if is_true(conditions, ConditionType::Failed) {
        LifecycleState::Failed
    } else if is_true(conditions, ConditionType::OrphanMitigation) {
        LifecycleState::OrphanMitigation
    } else if is_true(conditions, ConditionType::Ready) {
        LifecycleState::Ready
    } else if find_condition(conditions, ConditionType::Ready).is_some() {
        LifecycleState::InProgress
    } else {
        LifecycleState::New
    }
}

/// Set or replace the condition of `kind`
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    kind: ConditionType,
    status: ConditionStatus,
    reason: &str,
    message: &str,
) {
    let existing = conditions.iter_mut().find(|c| c.r#type == kind.as_str());
    match existing {
        Some(condition) => {
            if condition.status != status.as_str() {
                condition.status = status.as_str().to_string();
                condition.last_transition_time = Some(chrono::Utc::now().to_rfc3339());
            }
            condition.reason = Some(reason.to_string());
            condition.message = Some(message.to_string());
        }
        None => conditions.push(Condition {
            r#type: kind.as_str().to_string(),
            status: status.as_str().to_string(),
            last_transition_time: Some(chrono::Utc::now().to_rfc3339()),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
        }),
    }
}

pub fn remove_condition(conditions: &mut Vec<Condition>, kind: ConditionType) {
    conditions.retain(|c| c.r#type != kind.as_str());
}

/// Status types carrying a condition list
pub trait ConditionedStatus {
    fn conditions(&self) -> &[Condition];
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;
    fn set_last_condition_state(&mut self, reason: &str);

    /// Update Ready and mirror its reason into `lastConditionState`
    fn set_ready(&mut self, status: ConditionStatus, reason: &str, message: &str) {
        set_condition(
            self.conditions_mut(),
            ConditionType::Ready,
            status,
            reason,
            message,
        );
        self.set_last_condition_state(reason);
    }

    /// Ready=False plus Failed=True with the same reason
    fn set_failed(&mut self, reason: &str, message: &str) {
        self.set_ready(ConditionStatus::False, reason, message);
        set_condition(
            self.conditions_mut(),
            ConditionType::Failed,
            ConditionStatus::True,
            reason,
            message,
        );
    }

    fn clear_failed(&mut self) {
        remove_condition(self.conditions_mut(), ConditionType::Failed);
    }

    fn lifecycle_state(&self) -> LifecycleState {
        lifecycle_state(self.conditions())
    }
}

impl ConditionedStatus for ServiceInstanceStatus {
    fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.conditions
    }

    fn set_last_condition_state(&mut self, reason: &str) {
        self.last_condition_state = Some(reason.to_string());
    }
}

impl ConditionedStatus for ServiceBindingStatus {
    fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.conditions
    }

    fn set_last_condition_state(&mut self, reason: &str) {
        self.last_condition_state = Some(reason.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_time_moves_only_on_status_change() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            ConditionType::Ready,
            ConditionStatus::False,
            reasons::PROVISIONING,
            "working",
        );
        let stamped = Some("2020-01-01T00:00:00+00:00".to_string());
        conditions[0].last_transition_time.clone_from(&stamped);

        set_condition(
            &mut conditions,
            ConditionType::Ready,
            ConditionStatus::False,
            reasons::PROVISION_CALL_FAILED,
            "still working",
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, stamped);
        assert_eq!(conditions[0].reason.as_deref(), Some(reasons::PROVISION_CALL_FAILED));

        set_condition(
            &mut conditions,
            ConditionType::Ready,
            ConditionStatus::True,
            reasons::PROVISIONED_SUCCESSFULLY,
            "done",
        );
        assert_ne!(conditions[0].last_transition_time, stamped);
    }

    #[test]
    fn test_lifecycle_state_reduction() {
        let mut status = ServiceInstanceStatus::default();
        assert_eq!(status.lifecycle_state(), LifecycleState::New);

        status.set_ready(ConditionStatus::False, reasons::PROVISIONING, "");
        assert_eq!(status.lifecycle_state(), LifecycleState::InProgress);

        status.set_ready(ConditionStatus::True, reasons::PROVISIONED_SUCCESSFULLY, "");
        assert_eq!(status.lifecycle_state(), LifecycleState::Ready);
        assert_eq!(
            status.last_condition_state.as_deref(),
            Some(reasons::PROVISIONED_SUCCESSFULLY)
        );

        status.set_failed(reasons::ERROR_NON_UPDATABLE_PLAN, "no");
        assert_eq!(status.lifecycle_state(), LifecycleState::Failed);
        assert!(!is_true(&status.conditions, ConditionType::Ready));

        status.clear_failed();
        assert_eq!(status.lifecycle_state(), LifecycleState::InProgress);
    }
}
