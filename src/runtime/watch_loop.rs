//! # Watch Loop
//!
//! Runs the instance and binding controllers side by side.
//!
//! Bindings also watch instances: an instance event requeues every binding in
//! the same namespace that references it, so a binding waiting for its instance
//! to become ready reacts immediately.

use crate::config::SharedControllerConfig;
use crate::controller::reconciler::{reconcile_binding, reconcile_instance, ReconcilerError};
use crate::controller::server::ServerState;
use crate::crd::{ServiceBinding, ServiceInstance};
use crate::observability::metrics;
use crate::runtime::error_policy::{handle_reconciliation_error, handle_watch_stream_error};
use crate::runtime::persist::apply_outcome;
use crate::runtime::ControllerContext;
use futures::StreamExt;
use kube::api::Api;
use kube::ResourceExt;
use kube_runtime::controller::{self, Action};
use kube_runtime::reflector::ObjectRef;
use kube_runtime::{watcher, Controller};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

const INSTANCE_KIND: &str = "instance";
const BINDING_KIND: &str = "binding";

/// Reconcile one instance and persist the result
///
/// # Errors
/// Propagates state machine and persistence failures to the error policy
pub async fn reconcile_instance_resource(
    obj: Arc<ServiceInstance>,
    ctx: Arc<ControllerContext>,
) -> Result<Action, ReconcilerError> {
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_default();
    let span = tracing::span!(
        tracing::Level::INFO,
        "controller.instance.reconcile",
        resource.name = name.as_str(),
        resource.namespace = namespace.as_str(),
        resource.version = obj.resource_version().as_deref().unwrap_or("unknown"),
        resource.generation = obj.metadata.generation.unwrap_or_default(),
    );
    async move {
        let start = Instant::now();
        metrics::increment_reconciliations(INSTANCE_KIND);
        let outcome = reconcile_instance(&obj, &ctx.reconciler).await?;
        debug!(
            status_changed = outcome.status_changed(),
            finalizer = ?outcome.finalizer,
            requeue = ?outcome.requeue,
            "instance.pass.complete"
        );
        let api: Api<ServiceInstance> = Api::namespaced(ctx.client.clone(), &namespace);
        let action = apply_outcome(&api, obj.as_ref(), outcome).await?;
        metrics::observe_reconciliation_duration(INSTANCE_KIND, start.elapsed().as_secs_f64());
        Ok(action)
    }
    .instrument(span)
    .await
}

/// Reconcile one binding and persist the result
///
/// # Errors
/// Propagates state machine and persistence failures to the error policy
pub async fn reconcile_binding_resource(
    obj: Arc<ServiceBinding>,
    ctx: Arc<ControllerContext>,
) -> Result<Action, ReconcilerError> {
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_default();
    let span = tracing::span!(
        tracing::Level::INFO,
        "controller.binding.reconcile",
        resource.name = name.as_str(),
        resource.namespace = namespace.as_str(),
        resource.version = obj.resource_version().as_deref().unwrap_or("unknown"),
        resource.generation = obj.metadata.generation.unwrap_or_default(),
    );
    async move {
        let start = Instant::now();
        metrics::increment_reconciliations(BINDING_KIND);
        let outcome = reconcile_binding(&obj, &ctx.reconciler).await?;
        debug!(
            status_changed = outcome.status_changed(),
            finalizer = ?outcome.finalizer,
            requeue = ?outcome.requeue,
            "binding.pass.complete"
        );
        let api: Api<ServiceBinding> = Api::namespaced(ctx.client.clone(), &namespace);
        let action = apply_outcome(&api, obj.as_ref(), outcome).await?;
        metrics::observe_reconciliation_duration(BINDING_KIND, start.elapsed().as_secs_f64());
        Ok(action)
    }
    .instrument(span)
    .await
}

/// Drop stream errors that should restart the watch; reset the backoff on success
async fn filter_stream_item<T, E: std::fmt::Debug>(
    item: Result<T, E>,
    backoff: Arc<AtomicU64>,
    controller_config: SharedControllerConfig,
) -> Option<Result<T, E>> {
    let config = controller_config.read().await;
    let backoff_start = config.backoff_start_ms;
    let max_backoff = config.backoff_max_ms;
    let watch_restart_delay = config.watch_restart_delay_duration();
    drop(config);

    match &item {
        Ok(_) => {
            backoff.store(backoff_start, Ordering::Relaxed);
            debug!("watch.event.success");
            Some(item)
        }
        Err(e) => {
            let error_string = format!("{e:?}");
            handle_watch_stream_error(&error_string, &backoff, max_backoff, watch_restart_delay)
                .await
                .map(|()| item)
        }
    }
}

async fn watch_instances(
    ctx: Arc<ControllerContext>,
    server_state: Arc<ServerState>,
    controller_config: SharedControllerConfig,
) {
    let config = controller_config.read().await;
    let backoff_ms = Arc::new(AtomicU64::new(config.backoff_start_ms));
    let concurrency = config.max_concurrent_reconciliations;
    drop(config);

    while server_state.ready() {
        info!("Starting ServiceInstance controller...");
        let instances: Api<ServiceInstance> = Api::all(ctx.client.clone());
        let backoff = Arc::clone(&backoff_ms);
        let filter_config = Arc::clone(&controller_config);

        Controller::new(instances, watcher::Config::default().any_semantic())
            .with_config(controller::Config::default().concurrency(concurrency))
            .shutdown_on_signal()
            .run(
                reconcile_instance_resource,
                |obj, error, ctx| handle_reconciliation_error(&obj, error, &ctx, INSTANCE_KIND),
                Arc::clone(&ctx),
            )
            .filter_map(move |item| {
                filter_stream_item(item, Arc::clone(&backoff), Arc::clone(&filter_config))
            })
            .for_each(|_| futures::future::ready(()))
            .await;

        if !server_state.ready() {
            break;
        }
        let delay = controller_config
            .read()
            .await
            .watch_restart_delay_after_end_duration();
        warn!(
            "ServiceInstance watch stream ended, restarting in {:?}...",
            delay
        );
        tokio::time::sleep(delay).await;
    }
    info!("ServiceInstance controller stopped");
}

async fn watch_bindings(
    ctx: Arc<ControllerContext>,
    server_state: Arc<ServerState>,
    controller_config: SharedControllerConfig,
) {
    let config = controller_config.read().await;
    let backoff_ms = Arc::new(AtomicU64::new(config.backoff_start_ms));
    let concurrency = config.max_concurrent_reconciliations;
    drop(config);

    while server_state.ready() {
        info!("Starting ServiceBinding controller...");
        let bindings: Api<ServiceBinding> = Api::all(ctx.client.clone());
        let instances: Api<ServiceInstance> = Api::all(ctx.client.clone());
        let backoff = Arc::clone(&backoff_ms);
        let filter_config = Arc::clone(&controller_config);

        let controller = Controller::new(bindings, watcher::Config::default().any_semantic());
        let store = controller.store();
        controller
            .watches(instances, watcher::Config::default(), move |instance| {
                let namespace = instance.namespace();
                let name = instance.name_any();
                store
                    .state()
                    .into_iter()
                    .filter(|binding| {
                        binding.namespace() == namespace && binding.spec.instance_ref.name == name
                    })
                    .map(|binding| ObjectRef::from_obj(binding.as_ref()))
                    .collect::<Vec<_>>()
            })
            .with_config(controller::Config::default().concurrency(concurrency))
            .shutdown_on_signal()
            .run(
                reconcile_binding_resource,
                |obj, error, ctx| handle_reconciliation_error(&obj, error, &ctx, BINDING_KIND),
                Arc::clone(&ctx),
            )
            .filter_map(move |item| {
                filter_stream_item(item, Arc::clone(&backoff), Arc::clone(&filter_config))
            })
            .for_each(|_| futures::future::ready(()))
            .await;

        if !server_state.ready() {
            break;
        }
        let delay = controller_config
            .read()
            .await
            .watch_restart_delay_after_end_duration();
        warn!("ServiceBinding watch stream ended, restarting in {:?}...", delay);
        tokio::time::sleep(delay).await;
    }
    info!("ServiceBinding controller stopped");
}

/// Run both controllers until shutdown
///
/// # Errors
/// Currently always returns `Ok`; both controllers restart their own watches.
pub async fn run_watch_loop(
    ctx: Arc<ControllerContext>,
    server_state: Arc<ServerState>,
    controller_config: SharedControllerConfig,
) -> Result<(), anyhow::Error> {
    info!("Starting controller watch loops...");

    let shutdown_state = Arc::clone(&server_state);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("Received shutdown signal (SIGINT/SIGTERM), initiating graceful shutdown...");
        shutdown_state.set_ready(false);
        info!("Marked server as not ready, waiting for in-flight reconciliations to complete...");
    });

    tokio::join!(
        watch_instances(
            Arc::clone(&ctx),
            Arc::clone(&server_state),
            Arc::clone(&controller_config)
        ),
        watch_bindings(ctx, server_state, controller_config),
    );

    info!("Controller stopped gracefully");
    Ok(())
}
