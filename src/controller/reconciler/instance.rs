//! # Instance State Machine
//!
//! Drives a `ServiceInstance` through provision, update and deprovision.
//!
//! ## Flow
//!
//! 1. Deletion: deprovision at the broker if anything may exist there, then drop the finalizer
//! 2. An async operation in flight is polled
//! 3. An operation recorded in status is issued
//! 4. Otherwise the spec is compared with what the broker last confirmed and a
//!    Provision or Update is recorded when they differ
//!
//! Operations are recorded in status before they are sent, so a crash between
//! the two never loses track of a broker request.

use crate::broker::{
    BrokerClient, BrokerError, BrokerErrorClass, DeprovisionRequest, LastOperationRequest,
    LastOperationState, PreviousValues, ProvisionRequest, UpdateInstanceRequest,
};
use crate::catalog::{resolve_plan_reference, CatalogError, CatalogScope, ResolvedPlanReference};
use crate::controller::parameters::{resolve_parameters, ParameterError, ResolvedParameters};
use crate::controller::reconciler::conditions::{
    reasons, set_condition, ConditionStatus, ConditionType, ConditionedStatus, LifecycleState,
};
use crate::controller::reconciler::outcome::{FinalizerChange, Flow, Outcome, Pass, Requeue};
use crate::controller::reconciler::types::{BackoffState, Reconciler, ReconcilerError, TriggerSource};
use crate::controller::reconciler::{has_finalizer, now_rfc3339};
use crate::crd::{
    DeleteStatus, InstanceOperation, InstancePropertiesState, ProvisionStatus, ResolvedReferences,
    ServiceInstance, ServiceInstanceStatus,
};
use crate::observability::metrics;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const KIND: &str = "instance";

/// Evaluate one instance and decide what to persist and when to come back
///
/// # Errors
/// Only failures to read the catalog or secrets surface as errors; every broker
/// outcome is folded into status.
pub async fn reconcile_instance(
    instance: &ServiceInstance,
    ctx: &Reconciler,
) -> Result<Outcome<ServiceInstanceStatus>, ReconcilerError> {
    let name = instance
        .metadata
        .name
        .as_deref()
        .ok_or(ReconcilerError::MissingMetadata("metadata.name"))?;
    let namespace = instance
        .metadata
        .namespace
        .as_deref()
        .ok_or(ReconcilerError::MissingMetadata("metadata.namespace"))?;

    InstanceMachine {
        ctx,
        instance,
        name,
        namespace,
        generation: instance.metadata.generation.unwrap_or_default(),
        key: Reconciler::backoff_key(KIND, namespace, name),
        pass: Pass::new(instance.status.clone().unwrap_or_default()),
    }
    .run()
    .await
}

struct InstanceMachine<'a> {
    ctx: &'a Reconciler,
    instance: &'a ServiceInstance,
    name: &'a str,
    namespace: &'a str,
    generation: i64,
    key: String,
    pass: Pass<ServiceInstanceStatus>,
}

impl InstanceMachine<'_> {
    fn finish(self, requeue: Requeue) -> Outcome<ServiceInstanceStatus> {
        self.pass.finish(requeue)
    }

    fn deleting(&self) -> bool {
        self.instance.metadata.deletion_timestamp.is_some()
    }

    fn status(&mut self) -> &mut ServiceInstanceStatus {
        &mut self.pass.status
    }

    fn resync(&self) -> Requeue {
        Requeue::After(
            self.ctx.config.resync_interval_duration(),
            TriggerSource::Resync,
        )
    }

    async fn run(mut self) -> Result<Outcome<ServiceInstanceStatus>, ReconcilerError> {
        let finalized = has_finalizer(&self.instance.metadata);
        if self.deleting() {
            if !finalized {
                return Ok(self.finish(Requeue::AwaitChange));
            }
            return self.reconcile_delete().await;
        }
        if !finalized {
            self.pass.finalizer = FinalizerChange::Add;
        }

        if self.pass.status.async_op_in_progress {
            return self.poll().await;
        }
        if let Some(operation) = self.pass.status.current_operation {
            return self.issue(operation).await;
        }
        if self.reconciled_current_generation() {
            return Ok(self.converged());
        }
        if self.pass.status.lifecycle_state() == LifecycleState::Failed
            && self.pass.status.observed_generation == Some(self.generation)
        {
            debug!(
                resource.name = self.name,
                resource.namespace = self.namespace,
                generation = self.generation,
                "instance.failed.awaiting_spec_change"
            );
            return Ok(self.finish(Requeue::AwaitChange));
        }
        self.reconcile_spec().await
    }

    /// The broker already holds what this generation asks for
    ///
    /// Plan and parameters are only resolved again once the generation moves, so
    /// edits to referenced secrets never reach the broker on their own.
    fn reconciled_current_generation(&self) -> bool {
        let status = &self.pass.status;
        status.provision_status == Some(ProvisionStatus::Provisioned)
            && status.reconciled_generation == Some(self.generation)
            && status.observed_update_requests == Some(self.instance.spec.update_requests)
    }

    /// Re-assert Ready and come back on the resync interval
    fn converged(mut self) -> Outcome<ServiceInstanceStatus> {
        let generation = self.generation;
        let status = self.status();
        status.observed_generation = Some(generation);
        if status.lifecycle_state() != LifecycleState::Ready {
            status.clear_failed();
            status.set_ready(
                ConditionStatus::True,
                reasons::PROVISIONED_SUCCESSFULLY,
                "The instance was provisioned successfully",
            );
        }
        self.ctx.with_backoff(&self.key, generation, BackoffState::reset);
        let requeue = self.resync();
        self.finish(requeue)
    }

    async fn reconcile_delete(mut self) -> Result<Outcome<ServiceInstanceStatus>, ReconcilerError> {
        if self.pass.status.deprovision_status == Some(DeleteStatus::Failed)
            && self.pass.status.observed_generation != Some(self.generation)
        {
            info!(
                "🔁 ServiceInstance {}/{} changed since the broker refused to deprovision it, trying again",
                self.namespace, self.name
            );
            let status = self.status();
            status.deprovision_status = Some(DeleteStatus::Required);
            status.clear_failed();
        }

        let status = &self.pass.status;
        match status.deprovision_status {
            Some(DeleteStatus::Failed) => {
                warn!(
                    "⚠️  ServiceInstance {}/{} cannot be removed: the broker refused to deprovision it",
                    self.namespace, self.name
                );
                return Ok(self.finish(Requeue::AwaitChange));
            }
            Some(DeleteStatus::Required) if status.resolved_references.is_some() => {}
            _ => {
                info!(
                    "✅ ServiceInstance {}/{} needs no broker cleanup, releasing finalizer",
                    self.namespace, self.name
                );
                self.ctx.forget(&self.key);
                self.pass.finalizer = FinalizerChange::Remove;
                return Ok(self.finish(Requeue::AwaitChange));
            }
        }

        if status.current_operation == Some(InstanceOperation::Deprovision) {
            if status.async_op_in_progress {
                return self.poll().await;
            }
            return self.issue_deprovision().await;
        }

        let status = self.status();
        status.current_operation = Some(InstanceOperation::Deprovision);
        status.async_op_in_progress = false;
        status.last_operation = None;
        status.operation_start_time = Some(now_rfc3339());
        status.set_ready(
            ConditionStatus::False,
            reasons::DEPROVISION_REQUEST_IN_FLIGHT,
            "Deprovision request for ServiceInstance in-flight to Broker",
        );
        info!(
            "📝 Recorded deprovision for ServiceInstance {}/{}",
            self.namespace, self.name
        );
        Ok(self.finish(Requeue::now(TriggerSource::OperationRecorded)))
    }

    async fn reconcile_spec(mut self) -> Result<Outcome<ServiceInstanceStatus>, ReconcilerError> {
        let resolved = match resolve_plan_reference(
            self.ctx.catalog.as_ref(),
            &self.instance.spec.plan_reference,
            self.namespace,
        )
        .await
        {
            Ok(resolved) => {
                self.ctx
                    .with_backoff(&self.key, self.generation, |s| s.catalog_misses = 0);
                resolved
            }
            Err(CatalogError::InvalidReference(message)) => {
                let generation = self.generation;
                let status = self.status();
                status.observed_generation = Some(generation);
                status.set_failed(reasons::ERROR_INVALID_PLAN_REFERENCE, &message);
                return Ok(self.finish(Requeue::AwaitChange));
            }
            Err(e @ CatalogError::ClassNotFound(_)) => {
                let requeue = self.catalog_miss(reasons::REFERENCES_NONEXISTENT_SERVICE_CLASS, &e);
                return Ok(self.finish(requeue));
            }
            Err(e @ CatalogError::PlanNotFound(_)) => {
                let requeue = self.catalog_miss(reasons::REFERENCES_NONEXISTENT_SERVICE_PLAN, &e);
                return Ok(self.finish(requeue));
            }
            Err(e) => return Err(e.into()),
        };

        let parameters = match self.parameters().await? {
            Flow::Next(parameters) => parameters,
            Flow::Stop(requeue) => return Ok(self.finish(requeue)),
        };
        let desired = desired_properties(&resolved, &parameters);
        let references = ResolvedReferences {
            scope: resolved.class.scope.reference_scope(),
            class_name: resolved.class.name.clone(),
            plan_name: resolved.plan.name.clone(),
            broker_name: resolved.class.broker_name.clone(),
        };

        if self.pass.status.provision_status != Some(ProvisionStatus::Provisioned) {
            self.record(InstanceOperation::Provision, desired, references);
            return Ok(self.finish(Requeue::now(TriggerSource::OperationRecorded)));
        }

        let confirmed = self
            .pass
            .status
            .external_properties
            .clone()
            .unwrap_or_default();
        let plan_changed = confirmed.plan_external_id != desired.plan_external_id;
        let parameters_changed = confirmed.parameter_checksum != desired.parameter_checksum;
        let update_requested =
            self.pass.status.observed_update_requests != Some(self.instance.spec.update_requests);

        if plan_changed && !resolved.class.plan_updatable {
            let message = format!(
                "The plan of ServiceInstance {}/{} cannot change from {} to {}: class {} does not allow plan updates",
                self.namespace,
                self.name,
                confirmed.plan_external_name.as_deref().unwrap_or("<unknown>"),
                resolved.plan.external_name,
                resolved.class.external_name,
            );
            warn!("🚫 {}", message);
            let generation = self.generation;
            let status = self.status();
            status.observed_generation = Some(generation);
            status.set_failed(reasons::ERROR_NON_UPDATABLE_PLAN, &message);
            return Ok(self.finish(Requeue::AwaitChange));
        }

        if plan_changed || parameters_changed || update_requested {
            debug!(
                resource.name = self.name,
                resource.namespace = self.namespace,
                plan_changed,
                parameters_changed,
                update_requested,
                "instance.update.detected"
            );
            self.record(InstanceOperation::Update, desired, references);
            return Ok(self.finish(Requeue::now(TriggerSource::OperationRecorded)));
        }

        Ok(self.converged())
    }

    fn catalog_miss(&mut self, reason: &str, error: &CatalogError) -> Requeue {
        let limit = self.ctx.config.catalog_not_found_retry_limit;
        let (misses, delay) = self.ctx.with_backoff(&self.key, self.generation, |s| {
            s.catalog_misses += 1;
            (s.catalog_misses, s.backoff.next_backoff())
        });
        let message = format!("The instance {error}");
        let generation = self.generation;
        let status = self.status();
        if misses > limit {
            status.observed_generation = Some(generation);
            status.set_failed(reason, &message);
            return Requeue::AwaitChange;
        }
        status.set_ready(ConditionStatus::False, reason, &message);
        info!(
            "⏳ Catalog entry for ServiceInstance {}/{} not found yet ({}/{}), retrying in {:?}",
            self.namespace, self.name, misses, limit, delay
        );
        Requeue::After(delay, TriggerSource::WaitingForResource)
    }

    async fn parameters(&mut self) -> Result<Flow<ResolvedParameters>, ReconcilerError> {
        let spec = &self.instance.spec;
        match resolve_parameters(
            spec.parameters.as_ref(),
            &spec.parameters_from,
            self.ctx.secrets.as_ref(),
            self.namespace,
        )
        .await
        {
            Ok(parameters) => Ok(Flow::Next(parameters)),
            Err(ParameterError::Store(e)) => Err(e.into()),
            Err(e) => {
                warn!(
                    "❌ Parameters of ServiceInstance {}/{} cannot be built: {}",
                    self.namespace, self.name, e
                );
                let generation = self.generation;
                let status = self.status();
                status.current_operation = None;
                status.in_progress_properties = None;
                status.operation_start_time = None;
                status.observed_generation = Some(generation);
                status.set_failed(
                    reasons::ERROR_WITH_PARAMETERS,
                    &format!("Error building parameters: {e}"),
                );
                Ok(Flow::Stop(Requeue::AwaitChange))
            }
        }
    }

    fn record(
        &mut self,
        operation: InstanceOperation,
        desired: InstancePropertiesState,
        references: ResolvedReferences,
    ) {
        let generation = self.generation;
        let update_requests = self.instance.spec.update_requests;
        let spec_external_id = self.instance.spec.external_id.clone();
        let status = self.status();
        if status.external_id.is_none() {
            status.external_id =
                Some(spec_external_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()));
        }
        status.current_operation = Some(operation);
        status.in_progress_properties = Some(desired);
        status.resolved_references = Some(references);
        status.operation_start_time = Some(now_rfc3339());
        status.async_op_in_progress = false;
        status.last_operation = None;
        status.observed_generation = Some(generation);
        status.observed_update_requests = Some(update_requests);
        status.clear_failed();

        match operation {
            InstanceOperation::Provision => {
                status.deprovision_status = Some(DeleteStatus::Required);
                if status.provision_status.is_none() {
                    status.provision_status = Some(ProvisionStatus::NotProvisioned);
                }
                status.set_ready(
                    ConditionStatus::False,
                    reasons::PROVISION_REQUEST_IN_FLIGHT,
                    "Provision request for ServiceInstance in-flight to Broker",
                );
            }
            InstanceOperation::Update => status.set_ready(
                ConditionStatus::False,
                reasons::UPDATE_REQUEST_IN_FLIGHT,
                "Update request for ServiceInstance in-flight to Broker",
            ),
            InstanceOperation::Deprovision => {}
        }
        info!(
            "📝 Recorded {:?} for ServiceInstance {}/{}",
            operation, self.namespace, self.name
        );
    }

    /// Client for the broker recorded in status
    async fn broker_client(&mut self) -> Flow<Arc<dyn BrokerClient>> {
        let Some(references) = self.pass.status.resolved_references.clone() else {
            return Flow::Stop(self.abandon_operation());
        };
        let broker =
            CatalogScope::from_reference(references.scope, self.namespace).broker(&references.broker_name);
        match self.ctx.brokers.client_for(&broker).await {
            Ok(client) => Flow::Next(client),
            Err(e) => {
                let reason = match e {
                    BrokerError::UnknownBroker(_) => reasons::REFERENCES_NONEXISTENT_BROKER,
                    _ => reasons::ERROR_GETTING_BROKER_CLIENT,
                };
                warn!(
                    "⚠️  No client for broker {} of ServiceInstance {}/{}: {}",
                    broker, self.namespace, self.name, e
                );
                let delay = self
                    .ctx
                    .with_backoff(&self.key, self.generation, |s| s.backoff.next_backoff());
                self.status().set_ready(
                    ConditionStatus::False,
                    reason,
                    &format!("Cannot reach broker {broker}: {e}"),
                );
                Flow::Stop(Requeue::After(delay, TriggerSource::WaitingForResource))
            }
        }
    }

    /// Drop an operation whose recorded state is incomplete so it is recorded afresh
    fn abandon_operation(&mut self) -> Requeue {
        warn!(
            "⚠️  ServiceInstance {}/{} has an incomplete operation record, starting over",
            self.namespace, self.name
        );
        let status = self.status();
        status.current_operation = None;
        status.async_op_in_progress = false;
        status.last_operation = None;
        status.in_progress_properties = None;
        Requeue::now(TriggerSource::OperationRecorded)
    }

    /// Service and plan ids for an operation, preferring in-flight properties
    fn operation_ids(&self, prefer_confirmed: bool) -> Option<(String, String)> {
        let status = &self.pass.status;
        let (first, second) = if prefer_confirmed {
            (&status.external_properties, &status.in_progress_properties)
        } else {
            (&status.in_progress_properties, &status.external_properties)
        };
        first.iter().chain(second.iter()).find_map(|props| {
            Some((
                props.class_external_id.clone()?,
                props.plan_external_id.clone()?,
            ))
        })
    }

    fn instance_id(&self) -> String {
        self.pass.status.external_id.clone().unwrap_or_default()
    }

    async fn issue(
        self,
        operation: InstanceOperation,
    ) -> Result<Outcome<ServiceInstanceStatus>, ReconcilerError> {
        match operation {
            InstanceOperation::Provision => self.issue_provision().await,
            InstanceOperation::Update => self.issue_update().await,
            InstanceOperation::Deprovision => self.issue_deprovision().await,
        }
    }

    /// Refresh the in-flight properties with the parameters about to be sent
    fn refresh_in_progress(&mut self, parameters: &ResolvedParameters) {
        if let Some(props) = self.status().in_progress_properties.as_mut() {
            props.parameters = parameters.for_status();
            props.parameter_checksum.clone_from(&parameters.checksum);
        }
    }

    async fn issue_provision(mut self) -> Result<Outcome<ServiceInstanceStatus>, ReconcilerError> {
        let Some((service_id, plan_id)) = self.operation_ids(false) else {
            let requeue = self.abandon_operation();
            return Ok(self.finish(requeue));
        };
        let parameters = match self.parameters().await? {
            Flow::Next(parameters) => parameters,
            Flow::Stop(requeue) => return Ok(self.finish(requeue)),
        };
        let client = match self.broker_client().await {
            Flow::Next(client) => client,
            Flow::Stop(requeue) => return Ok(self.finish(requeue)),
        };
        self.refresh_in_progress(&parameters);

        let request = ProvisionRequest {
            instance_id: self.instance_id(),
            service_id,
            plan_id,
            organization_guid: self.ctx.config.cluster_id.clone(),
            space_guid: self.namespace.to_string(),
            parameters: parameters.for_request(),
            context: Some(self.ctx.request_context(self.namespace)),
            accepts_incomplete: true,
        };
        info!(
            "📦 Provisioning ServiceInstance {}/{} (instance id {}, plan {})",
            self.namespace, self.name, request.instance_id, request.plan_id
        );

        let requeue = match client.provision_instance(&request).await {
            Ok(response) => {
                if response.dashboard_url.is_some() {
                    self.status().dashboard_url = response.dashboard_url;
                }
                if response.is_async {
                    self.begin_async(
                        response.operation_key,
                        reasons::PROVISIONING,
                        "The instance is being provisioned asynchronously",
                    )
                } else {
                    self.finish_provision()
                }
            }
            Err(e) => self.provision_failed(&e),
        };
        Ok(self.finish(requeue))
    }

    fn provision_failed(&mut self, error: &BrokerError) -> Requeue {
        let message = format!("Error provisioning ServiceInstance: {error}");
        if error.is_ambiguous() {
            self.start_orphan_mitigation(reasons::PROVISION_CALL_FAILED, &message);
            return Requeue::now(TriggerSource::OperationRecorded);
        }
        match error.class() {
            BrokerErrorClass::Transient => self.retry_or_give_up(reasons::PROVISION_CALL_FAILED, &message),
            BrokerErrorClass::Gone | BrokerErrorClass::Terminal => {
                error!(
                    "❌ Broker rejected provision of ServiceInstance {}/{}: {}",
                    self.namespace, self.name, error
                );
                self.fail_operation(reasons::PROVISION_CALL_FAILED, &message);
                Requeue::AwaitChange
            }
        }
    }

    async fn issue_update(mut self) -> Result<Outcome<ServiceInstanceStatus>, ReconcilerError> {
        let Some((service_id, plan_id)) = self.operation_ids(false) else {
            let requeue = self.abandon_operation();
            return Ok(self.finish(requeue));
        };
        let parameters = match self.parameters().await? {
            Flow::Next(parameters) => parameters,
            Flow::Stop(requeue) => return Ok(self.finish(requeue)),
        };
        let client = match self.broker_client().await {
            Flow::Next(client) => client,
            Flow::Stop(requeue) => return Ok(self.finish(requeue)),
        };
        self.refresh_in_progress(&parameters);

        let previous_values = self.pass.status.external_properties.as_ref().and_then(|props| {
            Some(PreviousValues {
                service_id: props.class_external_id.clone()?,
                plan_id: props.plan_external_id.clone()?,
            })
        });
        let plan_changed = previous_values
            .as_ref()
            .is_none_or(|previous| previous.plan_id != plan_id);
        let request = UpdateInstanceRequest {
            instance_id: self.instance_id(),
            service_id,
            plan_id: plan_changed.then_some(plan_id),
            parameters: parameters.for_request(),
            previous_values,
            context: Some(self.ctx.request_context(self.namespace)),
            accepts_incomplete: true,
        };
        info!(
            "🔧 Updating ServiceInstance {}/{} (plan change: {})",
            self.namespace, self.name, plan_changed
        );

        let requeue = match client.update_instance(&request).await {
            Ok(response) => {
                if response.dashboard_url.is_some() {
                    self.status().dashboard_url = response.dashboard_url;
                }
                if response.is_async {
                    self.begin_async(
                        response.operation_key,
                        reasons::UPDATING,
                        "The instance is being updated asynchronously",
                    )
                } else {
                    self.finish_update()
                }
            }
            Err(e) => {
                let message = format!("Error updating ServiceInstance: {e}");
                match e.class() {
                    BrokerErrorClass::Transient => {
                        self.retry_or_give_up(reasons::UPDATE_CALL_FAILED, &message)
                    }
                    BrokerErrorClass::Gone | BrokerErrorClass::Terminal => {
                        self.fail_operation(reasons::UPDATE_CALL_FAILED, &message);
                        Requeue::AwaitChange
                    }
                }
            }
        };
        Ok(self.finish(requeue))
    }

    async fn issue_deprovision(mut self) -> Result<Outcome<ServiceInstanceStatus>, ReconcilerError> {
        let Some((service_id, plan_id)) = self.operation_ids(true) else {
            warn!(
                "⚠️  ServiceInstance {}/{} has no recorded plan, nothing to deprovision",
                self.namespace, self.name
            );
            let requeue = self.finish_deprovision();
            return Ok(self.finish(requeue));
        };
        let client = match self.broker_client().await {
            Flow::Next(client) => client,
            Flow::Stop(requeue) => return Ok(self.finish(requeue)),
        };

        let request = DeprovisionRequest {
            instance_id: self.instance_id(),
            service_id,
            plan_id,
            accepts_incomplete: true,
        };
        info!(
            "🗑️  Deprovisioning ServiceInstance {}/{} (instance id {})",
            self.namespace, self.name, request.instance_id
        );

        let requeue = match client.deprovision_instance(&request).await {
            Ok(response) if response.is_async => self.begin_async(
                response.operation_key,
                reasons::DEPROVISIONING,
                "The instance is being deprovisioned asynchronously",
            ),
            Ok(_) => self.finish_deprovision(),
            Err(e) if e.is_gone() => self.finish_deprovision(),
            Err(e) if e.class() == BrokerErrorClass::Transient => {
                let delay = self
                    .ctx
                    .with_backoff(&self.key, self.generation, BackoffState::record_error);
                warn!(
                    "🔄 Deprovision of ServiceInstance {}/{} failed, retrying in {:?}: {}",
                    self.namespace, self.name, delay, e
                );
                self.status().set_ready(
                    ConditionStatus::False,
                    reasons::DEPROVISION_CALL_FAILED,
                    &format!("Error deprovisioning ServiceInstance: {e}"),
                );
                Requeue::After(delay, TriggerSource::ErrorBackoff)
            }
            Err(e) => {
                error!(
                    "❌ Broker refused to deprovision ServiceInstance {}/{}: {}",
                    self.namespace, self.name, e
                );
                let generation = self.generation;
                let status = self.status();
                status.deprovision_status = Some(DeleteStatus::Failed);
                status.orphan_mitigation_in_progress = false;
                status.current_operation = None;
                status.operation_start_time = None;
                status.observed_generation = Some(generation);
                status.set_failed(
                    reasons::DEPROVISION_CALL_FAILED,
                    &format!("Error deprovisioning ServiceInstance: {e}"),
                );
                Requeue::AwaitChange
            }
        };
        Ok(self.finish(requeue))
    }

    async fn poll(mut self) -> Result<Outcome<ServiceInstanceStatus>, ReconcilerError> {
        let Some(operation) = self.pass.status.current_operation else {
            let requeue = self.abandon_operation();
            return Ok(self.finish(requeue));
        };
        let ids = self.operation_ids(operation == InstanceOperation::Deprovision);
        let client = match self.broker_client().await {
            Flow::Next(client) => client,
            Flow::Stop(requeue) => return Ok(self.finish(requeue)),
        };

        let request = LastOperationRequest {
            instance_id: self.instance_id(),
            service_id: ids.as_ref().map(|(service, _)| service.clone()),
            plan_id: ids.map(|(_, plan)| plan),
            operation_key: self.pass.status.last_operation.clone(),
        };

        let requeue = match client.poll_last_operation(&request).await {
            Ok(response) => match response.state {
                LastOperationState::InProgress => {
                    metrics::increment_async_polls(KIND, "in_progress");
                    let (reason, default_message) = match operation {
                        InstanceOperation::Provision => (
                            reasons::PROVISIONING,
                            "The instance is being provisioned asynchronously",
                        ),
                        InstanceOperation::Update => {
                            (reasons::UPDATING, "The instance is being updated asynchronously")
                        }
                        InstanceOperation::Deprovision => (
                            reasons::DEPROVISIONING,
                            "The instance is being deprovisioned asynchronously",
                        ),
                    };
                    let message = response
                        .description
                        .unwrap_or_else(|| default_message.to_string());
                    self.status()
                        .set_ready(ConditionStatus::False, reason, &message);
                    self.next_poll()
                }
                LastOperationState::Succeeded => {
                    metrics::increment_async_polls(KIND, "succeeded");
                    match operation {
                        InstanceOperation::Provision => self.finish_provision(),
                        InstanceOperation::Update => self.finish_update(),
                        InstanceOperation::Deprovision => self.finish_deprovision(),
                    }
                }
                LastOperationState::Failed => {
                    metrics::increment_async_polls(KIND, "failed");
                    self.async_failed(operation, response.description.as_deref())
                }
            },
            Err(e) if e.is_gone() && operation == InstanceOperation::Deprovision => {
                metrics::increment_async_polls(KIND, "gone");
                self.finish_deprovision()
            }
            Err(e) => {
                metrics::increment_async_polls(KIND, "error");
                let message = format!("Error polling last operation: {e}");
                if operation == InstanceOperation::Deprovision {
                    warn!(
                        "⚠️  Polling last operation of ServiceInstance {}/{} failed: {}",
                        self.namespace, self.name, e
                    );
                    self.status().set_ready(
                        ConditionStatus::False,
                        reasons::ERROR_POLLING_LAST_OPERATION,
                        &message,
                    );
                    self.next_poll()
                } else {
                    // A broker that lost the operation must not pin the instance in polling
                    self.retry_or_give_up(reasons::ERROR_POLLING_LAST_OPERATION, &message)
                }
            }
        };
        Ok(self.finish(requeue))
    }

    fn next_poll(&self) -> Requeue {
        let delay = self
            .ctx
            .with_backoff(&self.key, self.generation, BackoffState::next_poll);
        Requeue::After(delay, TriggerSource::AsyncPoll)
    }

    fn begin_async(&mut self, operation_key: Option<String>, reason: &str, message: &str) -> Requeue {
        let status = self.status();
        status.async_op_in_progress = true;
        status.last_operation = operation_key;
        status.set_ready(ConditionStatus::False, reason, message);
        let delay = self.ctx.with_backoff(&self.key, self.generation, |s| {
            s.reset_poll();
            s.next_poll()
        });
        Requeue::After(delay, TriggerSource::AsyncPoll)
    }

    fn clear_operation(&mut self) {
        let status = self.status();
        status.current_operation = None;
        status.operation_start_time = None;
        status.async_op_in_progress = false;
        status.last_operation = None;
    }

    /// Terminal failure of a provision or update
    fn fail_operation(&mut self, reason: &str, message: &str) {
        self.clear_operation();
        let generation = self.generation;
        let status = self.status();
        status.in_progress_properties = None;
        status.observed_generation = Some(generation);
        status.set_failed(reason, message);
    }

    fn async_failed(&mut self, operation: InstanceOperation, description: Option<&str>) -> Requeue {
        let detail = description.unwrap_or("no description provided");
        match operation {
            InstanceOperation::Provision => {
                self.fail_operation(
                    reasons::PROVISION_CALL_FAILED,
                    &format!("Asynchronous provision failed: {detail}"),
                );
                Requeue::AwaitChange
            }
            InstanceOperation::Update => {
                self.fail_operation(
                    reasons::UPDATE_CALL_FAILED,
                    &format!("Asynchronous update failed: {detail}"),
                );
                Requeue::AwaitChange
            }
            InstanceOperation::Deprovision => {
                // Re-issued on the next pass
                let status = self.status();
                status.async_op_in_progress = false;
                status.last_operation = None;
                status.set_ready(
                    ConditionStatus::False,
                    reasons::DEPROVISION_CALL_FAILED,
                    &format!("Asynchronous deprovision failed, retrying: {detail}"),
                );
                let delay = self
                    .ctx
                    .with_backoff(&self.key, self.generation, BackoffState::record_error);
                warn!(
                    "🔄 Asynchronous deprovision of ServiceInstance {}/{} failed, re-issuing in {:?}",
                    self.namespace, self.name, delay
                );
                Requeue::After(delay, TriggerSource::ErrorBackoff)
            }
        }
    }

    fn retry_or_give_up(&mut self, reason: &str, message: &str) -> Requeue {
        let max = self.ctx.config.max_broker_retries;
        let (attempts, delay) = self.ctx.with_backoff(&self.key, self.generation, |s| {
            let delay = s.record_error();
            (s.error_count, delay)
        });
        if attempts > max {
            error!(
                "❌ Giving up on ServiceInstance {}/{} after {} attempts: {}",
                self.namespace, self.name, attempts, message
            );
            self.fail_operation(
                reasons::ERROR_RECONCILIATION_RETRY_TIMEOUT,
                &format!("Stopped retrying after {attempts} attempts: {message}"),
            );
            return Requeue::AwaitChange;
        }
        warn!(
            "🔄 Retrying ServiceInstance {}/{} in {:?} (attempt {}/{}): {}",
            self.namespace, self.name, delay, attempts, max, message
        );
        self.status()
            .set_ready(ConditionStatus::False, reason, message);
        Requeue::After(delay, TriggerSource::ErrorBackoff)
    }

    fn start_orphan_mitigation(&mut self, reason: &str, message: &str) {
        warn!(
            "🧹 Starting orphan mitigation for ServiceInstance {}/{}: {}",
            self.namespace, self.name, message
        );
        metrics::increment_orphan_mitigations(KIND);
        self.ctx
            .with_backoff(&self.key, self.generation, BackoffState::record_error);
        let status = self.status();
        status.current_operation = Some(InstanceOperation::Deprovision);
        status.orphan_mitigation_in_progress = true;
        status.async_op_in_progress = false;
        status.last_operation = None;
        status.operation_start_time = Some(now_rfc3339());
        set_condition(
            &mut status.conditions,
            ConditionType::OrphanMitigation,
            ConditionStatus::True,
            reasons::STARTING_ORPHAN_MITIGATION,
            message,
        );
        status.set_ready(ConditionStatus::False, reason, message);
    }

    fn finish_provision(&mut self) -> Requeue {
        self.clear_operation();
        let generation = self.generation;
        let status = self.status();
        status.provision_status = Some(ProvisionStatus::Provisioned);
        status.external_properties = status.in_progress_properties.take();
        status.reconciled_generation = Some(generation);
        status.observed_generation = Some(generation);
        status.clear_failed();
        status.set_ready(
            ConditionStatus::True,
            reasons::PROVISIONED_SUCCESSFULLY,
            "The instance was provisioned successfully",
        );
        self.ctx.with_backoff(&self.key, generation, BackoffState::reset);
        info!(
            "✅ Provisioned ServiceInstance {}/{}",
            self.namespace, self.name
        );
        self.resync()
    }

    fn finish_update(&mut self) -> Requeue {
        self.clear_operation();
        let generation = self.generation;
        let status = self.status();
        status.external_properties = status.in_progress_properties.take();
        status.reconciled_generation = Some(generation);
        status.observed_generation = Some(generation);
        status.clear_failed();
        status.set_ready(
            ConditionStatus::True,
            reasons::UPDATED_SUCCESSFULLY,
            "The instance was updated successfully",
        );
        self.ctx.with_backoff(&self.key, generation, BackoffState::reset);
        info!("✅ Updated ServiceInstance {}/{}", self.namespace, self.name);
        self.resync()
    }

    fn finish_deprovision(&mut self) -> Requeue {
        self.clear_operation();
        let deleting = self.deleting();
        let generation = self.generation;
        let status = self.status();
        status.provision_status = Some(ProvisionStatus::NotProvisioned);

        if deleting {
            status.deprovision_status = Some(DeleteStatus::Succeeded);
            status.orphan_mitigation_in_progress = false;
            status.set_ready(
                ConditionStatus::False,
                reasons::DEPROVISIONED_SUCCESSFULLY,
                "The instance was deprovisioned successfully",
            );
            self.pass.finalizer = FinalizerChange::Remove;
            self.ctx.forget(&self.key);
            info!(
                "✅ Deprovisioned ServiceInstance {}/{}, releasing finalizer",
                self.namespace, self.name
            );
            return Requeue::AwaitChange;
        }

        // Orphan mitigation finished: the provision is retried from scratch
        status.orphan_mitigation_in_progress = false;
        status.deprovision_status = Some(DeleteStatus::NotRequired);
        status.in_progress_properties = None;
        status.external_properties = None;
        set_condition(
            &mut status.conditions,
            ConditionType::OrphanMitigation,
            ConditionStatus::False,
            reasons::ORPHAN_MITIGATION_SUCCESSFUL,
            "Orphan mitigation was completed successfully",
        );
        let max = self.ctx.config.max_broker_retries;
        let (attempts, delay) = self
            .ctx
            .with_backoff(&self.key, generation, |s| (s.error_count, s.backoff.next_backoff()));
        info!(
            "🧹 Orphan mitigation of ServiceInstance {}/{} completed",
            self.namespace, self.name
        );
        if attempts > max {
            let status = self.status();
            status.observed_generation = Some(generation);
            status.set_failed(
                reasons::ERROR_RECONCILIATION_RETRY_TIMEOUT,
                &format!("Stopped retrying provision after {attempts} attempts"),
            );
            return Requeue::AwaitChange;
        }
        Requeue::After(delay, TriggerSource::ErrorBackoff)
    }
}

fn desired_properties(
    resolved: &ResolvedPlanReference,
    parameters: &ResolvedParameters,
) -> InstancePropertiesState {
    InstancePropertiesState {
        class_external_name: Some(resolved.class.external_name.clone()),
        class_external_id: Some(resolved.class.external_id.clone()),
        plan_external_name: Some(resolved.plan.external_name.clone()),
        plan_external_id: Some(resolved.plan.external_id.clone()),
        parameters: parameters.for_status(),
        parameter_checksum: parameters.checksum.clone(),
    }
}
