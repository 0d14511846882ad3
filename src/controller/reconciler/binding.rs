//! # Binding State Machine
//!
//! Drives a `ServiceBinding` through bind, credential injection and unbind.
//!
//! A binding is bound once against a ready instance and is immutable after that.
//! The broker coordinates used for the bind are captured in status so an unbind
//! never depends on the instance or the catalog still existing.
//!
//! Failures after the broker may have created a binding (5xx, timeouts, a secret
//! that cannot be written) start orphan mitigation: an unbind followed by a fresh
//! bind attempt.

use crate::broker::{
    BindRequest, BindingLastOperationRequest, BrokerClient, BrokerError, BrokerErrorClass,
    GetBindingRequest, LastOperationState, UnbindRequest,
};
use crate::catalog::{resolve_recorded, CatalogError, CatalogScope};
use crate::controller::parameters::{resolve_parameters, ParameterError, ResolvedParameters};
use crate::controller::reconciler::conditions::{
    reasons, set_condition, ConditionStatus, ConditionType, ConditionedStatus, LifecycleState,
};
use crate::controller::reconciler::outcome::{FinalizerChange, Flow, Outcome, Pass, Requeue};
use crate::controller::reconciler::types::{BackoffState, Reconciler, ReconcilerError, TriggerSource};
use crate::controller::reconciler::{has_finalizer, now_rfc3339};
use crate::controller::transform::{apply_transforms, credentials_to_secret_data};
use crate::crd::{
    BindingOperation, BindingPropertiesState, BindingResolvedReferences, DeleteStatus,
    ServiceBinding, ServiceBindingStatus, ServiceInstance,
};
use crate::observability::metrics;
use kube::Resource;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const KIND: &str = "binding";

/// Evaluate one binding and decide what to persist and when to come back
///
/// # Errors
/// Failures to read the catalog, the referenced instance or secrets surface as
/// errors; broker outcomes are folded into status.
pub async fn reconcile_binding(
    binding: &ServiceBinding,
    ctx: &Reconciler,
) -> Result<Outcome<ServiceBindingStatus>, ReconcilerError> {
    let name = binding
        .metadata
        .name
        .as_deref()
        .ok_or(ReconcilerError::MissingMetadata("metadata.name"))?;
    let namespace = binding
        .metadata
        .namespace
        .as_deref()
        .ok_or(ReconcilerError::MissingMetadata("metadata.namespace"))?;

    BindingMachine {
        ctx,
        binding,
        name,
        namespace,
        generation: binding.metadata.generation.unwrap_or_default(),
        key: Reconciler::backoff_key(KIND, namespace, name),
        pass: Pass::new(binding.status.clone().unwrap_or_default()),
    }
    .run()
    .await
}

struct BindingMachine<'a> {
    ctx: &'a Reconciler,
    binding: &'a ServiceBinding,
    name: &'a str,
    namespace: &'a str,
    generation: i64,
    key: String,
    pass: Pass<ServiceBindingStatus>,
}

/// Whether an instance can be bound to right now
fn instance_ready(instance: &ServiceInstance) -> bool {
    instance.status.as_ref().is_some_and(|status| {
        status.lifecycle_state() == LifecycleState::Ready
            && !status.async_op_in_progress
            && status.current_operation.is_none()
            && status.external_id.is_some()
            && status.resolved_references.is_some()
    })
}

impl BindingMachine<'_> {
    fn finish(self, requeue: Requeue) -> Outcome<ServiceBindingStatus> {
        self.pass.finish(requeue)
    }

    fn deleting(&self) -> bool {
        self.binding.metadata.deletion_timestamp.is_some()
    }

    fn status(&mut self) -> &mut ServiceBindingStatus {
        &mut self.pass.status
    }

    fn binding_id(&self) -> String {
        self.pass.status.external_id.clone().unwrap_or_default()
    }

    async fn run(mut self) -> Result<Outcome<ServiceBindingStatus>, ReconcilerError> {
        let finalized = has_finalizer(&self.binding.metadata);
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
        match self.pass.status.current_operation {
            Some(BindingOperation::Bind) => return self.issue_bind().await,
            Some(BindingOperation::Unbind) => return self.issue_unbind().await,
            None => {}
        }
        if self.pass.status.lifecycle_state() == LifecycleState::Failed
            && self.pass.status.observed_generation == Some(self.generation)
        {
            debug!(
                resource.name = self.name,
                resource.namespace = self.namespace,
                generation = self.generation,
                "binding.failed.awaiting_spec_change"
            );
            return Ok(self.finish(Requeue::AwaitChange));
        }
        self.reconcile_spec().await
    }

    async fn reconcile_delete(mut self) -> Result<Outcome<ServiceBindingStatus>, ReconcilerError> {
        let required = self.pass.status.unbind_status == Some(DeleteStatus::Required)
            && self.pass.status.resolved_references.is_some();
        if !required {
            info!(
                "✅ ServiceBinding {}/{} needs no broker cleanup, releasing finalizer",
                self.namespace, self.name
            );
            self.ctx.forget(&self.key);
            self.pass.finalizer = FinalizerChange::Remove;
            return Ok(self.finish(Requeue::AwaitChange));
        }

        if self.pass.status.current_operation == Some(BindingOperation::Unbind) {
            if self.pass.status.async_op_in_progress {
                return self.poll().await;
            }
            return self.issue_unbind().await;
        }

        let status = self.status();
        status.current_operation = Some(BindingOperation::Unbind);
        status.async_op_in_progress = false;
        status.last_operation = None;
        status.operation_start_time = Some(now_rfc3339());
        status.set_ready(
            ConditionStatus::False,
            reasons::UNBIND_REQUEST_IN_FLIGHT,
            "Unbind request for ServiceBinding in-flight to Broker",
        );
        info!(
            "📝 Recorded unbind for ServiceBinding {}/{}",
            self.namespace, self.name
        );
        Ok(self.finish(Requeue::now(TriggerSource::OperationRecorded)))
    }

    async fn reconcile_spec(mut self) -> Result<Outcome<ServiceBindingStatus>, ReconcilerError> {
        if self.pass.status.external_properties.is_some() {
            // Bound; later spec changes are not sent to the broker
            let generation = self.generation;
            let status = self.status();
            status.observed_generation = Some(generation);
            if status.lifecycle_state() != LifecycleState::Ready {
                status.clear_failed();
                status.set_ready(
                    ConditionStatus::True,
                    reasons::INJECTED_BIND_RESULT,
                    "Injected bind result",
                );
            }
            self.ctx.with_backoff(&self.key, generation, BackoffState::reset);
            let resync = Requeue::After(
                self.ctx.config.resync_interval_duration(),
                TriggerSource::Resync,
            );
            return Ok(self.finish(resync));
        }

        let instance_name = self.binding.spec.instance_ref.name.as_str();
        let Some(instance) = self.ctx.instances.get(self.namespace, instance_name).await? else {
            let message = format!(
                "References a non-existent ServiceInstance {}/{}",
                self.namespace, instance_name
            );
            let requeue = self.wait_for(reasons::ERROR_NONEXISTENT_INSTANCE, &message);
            return Ok(self.finish(requeue));
        };
        if !instance_ready(&instance) {
            let message = format!(
                "Binding cannot begin because referenced ServiceInstance {}/{} is not ready",
                self.namespace, instance_name
            );
            let requeue = self.wait_for(reasons::ERROR_INSTANCE_NOT_READY, &message);
            return Ok(self.finish(requeue));
        }
        let Some((instance_refs, instance_id)) = instance.status.as_ref().and_then(|status| {
            Some((status.resolved_references.as_ref()?, status.external_id.clone()?))
        }) else {
            return Ok(self.finish(Requeue::AwaitChange));
        };

        let scope = CatalogScope::from_reference(instance_refs.scope, self.namespace);
        let resolved = match resolve_recorded(
            self.ctx.catalog.as_ref(),
            &scope,
            &instance_refs.class_name,
            &instance_refs.plan_name,
        )
        .await
        {
            Ok(resolved) => {
                self.ctx
                    .with_backoff(&self.key, self.generation, |s| s.catalog_misses = 0);
                resolved
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

        if !resolved.is_bindable() {
            let message = format!(
                "References a non-bindable ServiceClass ({}) and Plan ({}) combination",
                resolved.class.external_name, resolved.plan.external_name
            );
            warn!("🚫 ServiceBinding {}/{}: {}", self.namespace, self.name, message);
            let generation = self.generation;
            let status = self.status();
            status.observed_generation = Some(generation);
            status.set_failed(reasons::ERROR_NONBINDABLE_SERVICE_CLASS, &message);
            return Ok(self.finish(Requeue::AwaitChange));
        }

        let parameters = match self.parameters().await? {
            Flow::Next(parameters) => parameters,
            Flow::Stop(requeue) => return Ok(self.finish(requeue)),
        };

        let references = BindingResolvedReferences {
            scope: resolved.class.scope.reference_scope(),
            broker_name: resolved.class.broker_name.clone(),
            instance_external_id: instance_id,
            class_external_id: resolved.class.external_id.clone(),
            plan_external_id: resolved.plan.external_id.clone(),
        };
        self.record_bind(references, &parameters);
        Ok(self.finish(Requeue::now(TriggerSource::OperationRecorded)))
    }

    /// Ready=False while a dependency is missing; retried without a budget
    fn wait_for(&mut self, reason: &str, message: &str) -> Requeue {
        let delay = self
            .ctx
            .with_backoff(&self.key, self.generation, |s| s.backoff.next_backoff());
        info!(
            "⏳ ServiceBinding {}/{}: {}, retrying in {:?}",
            self.namespace, self.name, message, delay
        );
        self.status()
            .set_ready(ConditionStatus::False, reason, message);
        Requeue::After(delay, TriggerSource::WaitingForResource)
    }

    fn catalog_miss(&mut self, reason: &str, error: &CatalogError) -> Requeue {
        let limit = self.ctx.config.catalog_not_found_retry_limit;
        let (misses, delay) = self.ctx.with_backoff(&self.key, self.generation, |s| {
            s.catalog_misses += 1;
            (s.catalog_misses, s.backoff.next_backoff())
        });
        let message = format!("The binding's instance {error}");
        let generation = self.generation;
        let status = self.status();
        if misses > limit {
            status.observed_generation = Some(generation);
            status.set_failed(reason, &message);
            return Requeue::AwaitChange;
        }
        status.set_ready(ConditionStatus::False, reason, &message);
        Requeue::After(delay, TriggerSource::WaitingForResource)
    }

    async fn parameters(&mut self) -> Result<Flow<ResolvedParameters>, ReconcilerError> {
        let spec = &self.binding.spec;
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
                    "❌ Parameters of ServiceBinding {}/{} cannot be built: {}",
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

    fn record_bind(&mut self, references: BindingResolvedReferences, parameters: &ResolvedParameters) {
        let generation = self.generation;
        let spec_external_id = self.binding.spec.external_id.clone();
        let status = self.status();
        if status.external_id.is_none() {
            status.external_id =
                Some(spec_external_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()));
        }
        status.current_operation = Some(BindingOperation::Bind);
        status.in_progress_properties = Some(BindingPropertiesState {
            parameters: parameters.for_status(),
            parameter_checksum: parameters.checksum.clone(),
        });
        status.resolved_references = Some(references);
        status.operation_start_time = Some(now_rfc3339());
        status.async_op_in_progress = false;
        status.last_operation = None;
        status.unbind_status = Some(DeleteStatus::Required);
        status.observed_generation = Some(generation);
        status.clear_failed();
        status.set_ready(
            ConditionStatus::False,
            reasons::BIND_REQUEST_IN_FLIGHT,
            "Bind request for ServiceBinding in-flight to Broker",
        );
        info!(
            "📝 Recorded bind for ServiceBinding {}/{}",
            self.namespace, self.name
        );
    }

    async fn broker_client(
        &mut self,
        references: &BindingResolvedReferences,
    ) -> Flow<Arc<dyn BrokerClient>> {
        let broker = CatalogScope::from_reference(references.scope, self.namespace)
            .broker(&references.broker_name);
        match self.ctx.brokers.client_for(&broker).await {
            Ok(client) => Flow::Next(client),
            Err(e) => {
                let reason = match e {
                    BrokerError::UnknownBroker(_) => reasons::REFERENCES_NONEXISTENT_BROKER,
                    _ => reasons::ERROR_GETTING_BROKER_CLIENT,
                };
                warn!(
                    "⚠️  No client for broker {} of ServiceBinding {}/{}: {}",
                    broker, self.namespace, self.name, e
                );
                Flow::Stop(self.wait_for(reason, &format!("Cannot reach broker {broker}: {e}")))
            }
        }
    }

    fn abandon_operation(&mut self) -> Requeue {
        warn!(
            "⚠️  ServiceBinding {}/{} has an incomplete operation record, starting over",
            self.namespace, self.name
        );
        self.clear_operation();
        self.status().in_progress_properties = None;
        Requeue::now(TriggerSource::OperationRecorded)
    }

    fn clear_operation(&mut self) {
        let status = self.status();
        status.current_operation = None;
        status.operation_start_time = None;
        status.async_op_in_progress = false;
        status.last_operation = None;
    }

    async fn issue_bind(mut self) -> Result<Outcome<ServiceBindingStatus>, ReconcilerError> {
        let Some(references) = self.pass.status.resolved_references.clone() else {
            let requeue = self.abandon_operation();
            return Ok(self.finish(requeue));
        };
        let parameters = match self.parameters().await? {
            Flow::Next(parameters) => parameters,
            Flow::Stop(requeue) => return Ok(self.finish(requeue)),
        };
        let client = match self.broker_client(&references).await {
            Flow::Next(client) => client,
            Flow::Stop(requeue) => return Ok(self.finish(requeue)),
        };
        if let Some(props) = self.status().in_progress_properties.as_mut() {
            props.parameters = parameters.for_status();
            props.parameter_checksum.clone_from(&parameters.checksum);
        }

        let request = BindRequest {
            binding_id: self.binding_id(),
            instance_id: references.instance_external_id.clone(),
            service_id: references.class_external_id.clone(),
            plan_id: references.plan_external_id.clone(),
            app_guid: None,
            parameters: parameters.for_request(),
            context: Some(self.ctx.request_context(self.namespace)),
            accepts_incomplete: self.ctx.config.async_binding_operations,
        };
        info!(
            "🔗 Binding ServiceBinding {}/{} (binding id {}, instance id {})",
            self.namespace, self.name, request.binding_id, request.instance_id
        );

        let requeue = match client.bind(&request).await {
            Ok(response) if response.is_async => {
                self.begin_async(
                    response.operation_key,
                    reasons::BINDING,
                    "The binding is being created asynchronously",
                )
            }
            Ok(response) => {
                self.inject(&response.credentials.unwrap_or_default())
                    .await
            }
            Err(e) => self.bind_failed(&e),
        };
        Ok(self.finish(requeue))
    }

    fn bind_failed(&mut self, error: &BrokerError) -> Requeue {
        let message = format!("Error creating ServiceBinding: {error}");
        if error.is_ambiguous() {
            self.start_orphan_mitigation(reasons::BIND_CALL_FAILED, &message);
            return Requeue::now(TriggerSource::OperationRecorded);
        }
        match error.class() {
            BrokerErrorClass::Transient => self.retry_or_give_up(reasons::BIND_CALL_FAILED, &message),
            BrokerErrorClass::Gone | BrokerErrorClass::Terminal => {
                error!(
                    "❌ Broker rejected bind of ServiceBinding {}/{}: {}",
                    self.namespace, self.name, error
                );
                self.fail_bind(reasons::BIND_CALL_FAILED, &message);
                Requeue::AwaitChange
            }
        }
    }

    /// Terminal failure of a bind the broker did not carry out
    fn fail_bind(&mut self, reason: &str, message: &str) {
        self.clear_operation();
        let generation = self.generation;
        let status = self.status();
        status.in_progress_properties = None;
        status.unbind_status = Some(DeleteStatus::NotRequired);
        status.observed_generation = Some(generation);
        status.set_failed(reason, message);
    }

    fn retry_or_give_up(&mut self, reason: &str, message: &str) -> Requeue {
        let max = self.ctx.config.max_broker_retries;
        let (attempts, delay) = self.ctx.with_backoff(&self.key, self.generation, |s| {
            let delay = s.record_error();
            (s.error_count, delay)
        });
        if attempts > max {
            error!(
                "❌ Giving up on ServiceBinding {}/{} after {} attempts: {}",
                self.namespace, self.name, attempts, message
            );
            self.clear_operation();
            let generation = self.generation;
            let status = self.status();
            status.in_progress_properties = None;
            status.observed_generation = Some(generation);
            status.set_failed(
                reasons::ERROR_RECONCILIATION_RETRY_TIMEOUT,
                &format!("Stopped retrying after {attempts} attempts: {message}"),
            );
            return Requeue::AwaitChange;
        }
        warn!(
            "🔄 Retrying ServiceBinding {}/{} in {:?} (attempt {}/{}): {}",
            self.namespace, self.name, delay, attempts, max, message
        );
        self.status()
            .set_ready(ConditionStatus::False, reason, message);
        Requeue::After(delay, TriggerSource::ErrorBackoff)
    }

    fn start_orphan_mitigation(&mut self, reason: &str, message: &str) {
        warn!(
            "🧹 Starting orphan mitigation for ServiceBinding {}/{}: {}",
            self.namespace, self.name, message
        );
        metrics::increment_orphan_mitigations(KIND);
        self.ctx
            .with_backoff(&self.key, self.generation, BackoffState::record_error);
        let status = self.status();
        status.current_operation = Some(BindingOperation::Unbind);
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

    /// Transform the credentials and write them to the binding's secret
    async fn inject(&mut self, credentials: &Map<String, Value>) -> Requeue {
        let mut data = credentials_to_secret_data(credentials);
        let secret_name = self.binding.secret_name();
        let written = match apply_transforms(
            &mut data,
            credentials,
            &self.binding.spec.secret_transforms,
            self.ctx.secrets.as_ref(),
            self.namespace,
        )
        .await
        {
            Ok(()) => self
                .ctx
                .secrets
                .put(
                    self.namespace,
                    &secret_name,
                    data,
                    self.binding.controller_owner_ref(&()),
                )
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        if let Err(reason) = written {
            error!(
                "❌ Failed to inject credentials of ServiceBinding {}/{} into secret {}: {}",
                self.namespace, self.name, secret_name, reason
            );
            self.start_orphan_mitigation(
                reasons::ERROR_INJECTING_BIND_RESULT,
                &format!("Error injecting bind result into secret {secret_name}: {reason}"),
            );
            return Requeue::now(TriggerSource::OperationRecorded);
        }

        metrics::increment_secrets_injected();
        self.clear_operation();
        let generation = self.generation;
        let status = self.status();
        status.external_properties = status.in_progress_properties.take();
        status.reconciled_generation = Some(generation);
        status.observed_generation = Some(generation);
        status.clear_failed();
        status.set_ready(
            ConditionStatus::True,
            reasons::INJECTED_BIND_RESULT,
            "Injected bind result",
        );
        self.ctx.with_backoff(&self.key, generation, BackoffState::reset);
        info!(
            "✅ Injected credentials of ServiceBinding {}/{} into secret {}",
            self.namespace, self.name, secret_name
        );
        Requeue::After(
            self.ctx.config.resync_interval_duration(),
            TriggerSource::Resync,
        )
    }

    async fn issue_unbind(mut self) -> Result<Outcome<ServiceBindingStatus>, ReconcilerError> {
        let Some(references) = self.pass.status.resolved_references.clone() else {
            let requeue = self.finish_unbind().await?;
            return Ok(self.finish(requeue));
        };
        let client = match self.broker_client(&references).await {
            Flow::Next(client) => client,
            Flow::Stop(requeue) => return Ok(self.finish(requeue)),
        };

        let request = UnbindRequest {
            binding_id: self.binding_id(),
            instance_id: references.instance_external_id.clone(),
            service_id: references.class_external_id.clone(),
            plan_id: references.plan_external_id.clone(),
            accepts_incomplete: self.ctx.config.async_binding_operations,
        };
        info!(
            "🔓 Unbinding ServiceBinding {}/{} (binding id {})",
            self.namespace, self.name, request.binding_id
        );

        let requeue = match client.unbind(&request).await {
            Ok(response) if response.is_async => self.begin_async(
                response.operation_key,
                reasons::UNBINDING,
                "The binding is being deleted asynchronously",
            ),
            Ok(_) => self.finish_unbind().await?,
            Err(e) if e.is_gone() => self.finish_unbind().await?,
            Err(e) => {
                let delay = self
                    .ctx
                    .with_backoff(&self.key, self.generation, BackoffState::record_error);
                warn!(
                    "🔄 Unbind of ServiceBinding {}/{} failed, retrying in {:?}: {}",
                    self.namespace, self.name, delay, e
                );
                self.status().set_ready(
                    ConditionStatus::False,
                    reasons::UNBIND_CALL_FAILED,
                    &format!("Error unbinding from ServiceInstance: {e}"),
                );
                Requeue::After(delay, TriggerSource::ErrorBackoff)
            }
        };
        Ok(self.finish(requeue))
    }

    async fn finish_unbind(&mut self) -> Result<Requeue, ReconcilerError> {
        let secret_name = self.binding.secret_name();
        self.ctx.secrets.delete(self.namespace, &secret_name).await?;

        self.clear_operation();
        let deleting = self.deleting();
        let generation = self.generation;
        let status = self.status();
        status.in_progress_properties = None;
        status.external_properties = None;
        status.orphan_mitigation_in_progress = false;

        if deleting {
            status.unbind_status = Some(DeleteStatus::Succeeded);
            status.set_ready(
                ConditionStatus::False,
                reasons::UNBOUND_SUCCESSFULLY,
                "The binding was deleted successfully",
            );
            self.pass.finalizer = FinalizerChange::Remove;
            self.ctx.forget(&self.key);
            info!(
                "✅ Unbound ServiceBinding {}/{}, releasing finalizer",
                self.namespace, self.name
            );
            return Ok(Requeue::AwaitChange);
        }

        // Orphan mitigation finished: bind again from scratch
        status.unbind_status = Some(DeleteStatus::NotRequired);
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
            "🧹 Orphan mitigation of ServiceBinding {}/{} completed",
            self.namespace, self.name
        );
        if attempts > max {
            let status = self.status();
            status.observed_generation = Some(generation);
            status.set_failed(
                reasons::ERROR_RECONCILIATION_RETRY_TIMEOUT,
                &format!("Stopped retrying bind after {attempts} attempts"),
            );
            return Ok(Requeue::AwaitChange);
        }
        Ok(Requeue::After(delay, TriggerSource::ErrorBackoff))
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

    fn next_poll(&self) -> Requeue {
        let delay = self
            .ctx
            .with_backoff(&self.key, self.generation, BackoffState::next_poll);
        Requeue::After(delay, TriggerSource::AsyncPoll)
    }

    async fn poll(mut self) -> Result<Outcome<ServiceBindingStatus>, ReconcilerError> {
        let (Some(operation), Some(references)) = (
            self.pass.status.current_operation,
            self.pass.status.resolved_references.clone(),
        ) else {
            let requeue = self.abandon_operation();
            return Ok(self.finish(requeue));
        };
        let client = match self.broker_client(&references).await {
            Flow::Next(client) => client,
            Flow::Stop(requeue) => return Ok(self.finish(requeue)),
        };

        let request = BindingLastOperationRequest {
            instance_id: references.instance_external_id.clone(),
            binding_id: self.binding_id(),
            service_id: Some(references.class_external_id.clone()),
            plan_id: Some(references.plan_external_id.clone()),
            operation_key: self.pass.status.last_operation.clone(),
        };

        let requeue = match client.poll_binding_last_operation(&request).await {
            Ok(response) => match response.state {
                LastOperationState::InProgress => {
                    metrics::increment_async_polls(KIND, "in_progress");
                    let (reason, default_message) = match operation {
                        BindingOperation::Bind => {
                            (reasons::BINDING, "The binding is being created asynchronously")
                        }
                        BindingOperation::Unbind => {
                            (reasons::UNBINDING, "The binding is being deleted asynchronously")
                        }
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
                        BindingOperation::Bind => self.fetch_and_inject(&client, &references).await,
                        BindingOperation::Unbind => self.finish_unbind().await?,
                    }
                }
                LastOperationState::Failed => {
                    metrics::increment_async_polls(KIND, "failed");
                    let detail = response
                        .description
                        .unwrap_or_else(|| "no description provided".to_string());
                    match operation {
                        BindingOperation::Bind => {
                            self.fail_bind(
                                reasons::BIND_CALL_FAILED,
                                &format!("Asynchronous bind failed: {detail}"),
                            );
                            Requeue::AwaitChange
                        }
                        BindingOperation::Unbind => {
                            // Re-issued on the next pass
                            let delay = self.ctx.with_backoff(
                                &self.key,
                                self.generation,
                                BackoffState::record_error,
                            );
                            let status = self.status();
                            status.async_op_in_progress = false;
                            status.last_operation = None;
                            status.set_ready(
                                ConditionStatus::False,
                                reasons::UNBIND_CALL_FAILED,
                                &format!("Asynchronous unbind failed, retrying: {detail}"),
                            );
                            Requeue::After(delay, TriggerSource::ErrorBackoff)
                        }
                    }
                }
            },
            Err(e) if e.is_gone() && operation == BindingOperation::Unbind => {
                metrics::increment_async_polls(KIND, "gone");
                self.finish_unbind().await?
            }
            Err(e) => {
                metrics::increment_async_polls(KIND, "error");
                let message = format!("Error polling last operation: {e}");
                match operation {
                    BindingOperation::Bind => {
                        self.retry_or_give_up(reasons::ERROR_POLLING_LAST_OPERATION, &message)
                    }
                    BindingOperation::Unbind => {
                        warn!(
                            "⚠️  Polling last operation of ServiceBinding {}/{} failed: {}",
                            self.namespace, self.name, e
                        );
                        self.status().set_ready(
                            ConditionStatus::False,
                            reasons::ERROR_POLLING_LAST_OPERATION,
                            &message,
                        );
                        self.next_poll()
                    }
                }
            }
        };
        Ok(self.finish(requeue))
    }

    /// Completed asynchronous bind: fetch the credentials and inject them
    async fn fetch_and_inject(
        &mut self,
        client: &Arc<dyn BrokerClient>,
        references: &BindingResolvedReferences,
    ) -> Requeue {
        let request = GetBindingRequest {
            instance_id: references.instance_external_id.clone(),
            binding_id: self.binding_id(),
        };
        match client.get_binding(&request).await {
            Ok(response) => self.inject(&response.credentials.unwrap_or_default()).await,
            Err(e) => {
                self.start_orphan_mitigation(
                    reasons::ERROR_FETCHING_BINDING,
                    &format!("Error fetching binding: {e}"),
                );
                Requeue::now(TriggerSource::OperationRecorded)
            }
        }
    }
}
