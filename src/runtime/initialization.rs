//! # Initialization
//!
//! Controller startup: rustls, tracing, metrics, the probe server, the
//! Kubernetes client, the reconciler and a first pass over existing resources.

use crate::broker::KubeBrokerRegistry;
use crate::catalog::KubeCatalog;
use crate::config::{create_shared_config, SharedControllerConfig, SharedServerConfig};
use crate::controller::reconciler::Reconciler;
use crate::controller::server::{start_server, ServerState};
use crate::crd::{ServiceBinding, ServiceInstance};
use crate::observability;
use crate::runtime::watch_loop::{reconcile_binding_resource, reconcile_instance_resource};
use crate::runtime::ControllerContext;
use crate::store::{KubeInstanceLookup, KubeSecretStore};
use anyhow::{Context, Result};
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn, Instrument};

/// Everything the watch loop needs
pub struct InitializationResult {
    pub client: Client,
    pub context: Arc<ControllerContext>,
    /// Server state for health checks
    pub server_state: Arc<ServerState>,
    pub controller_config: SharedControllerConfig,
    pub server_config: SharedServerConfig,
}

impl std::fmt::Debug for InitializationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitializationResult")
            .field("server_ready", &self.server_state.ready())
            .finish_non_exhaustive()
    }
}

fn init_tracing(log_format: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "service_catalog_controller=info".into());
    let result = if log_format.eq_ignore_ascii_case("json") {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    };
    if let Err(e) = result {
        eprintln!("Tracing subscriber already initialized: {e}");
    }
}

/// Initialize the controller runtime
///
/// # Errors
/// Fails if metrics cannot be registered, the probe server does not come up,
/// or no Kubernetes client can be built.
pub async fn initialize() -> Result<InitializationResult> {
    // Must run before anything opens a TLS connection
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|existing| {
            anyhow::anyhow!("Failed to install rustls crypto provider, one is already installed: {existing:?}")
        })?;

    let (controller_config, server_config) = create_shared_config();
    let config = controller_config.read().await.clone();

    init_tracing(&config.log_format);

    info!("Starting Service Catalog Controller");
    info!(
        "Build info: timestamp={}, datetime={}, git_hash={}",
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_DATETIME"),
        env!("BUILD_GIT_HASH")
    );

    observability::metrics::register_metrics()?;

    let server_state = Arc::new(ServerState::new());
    let server_port = server_config.read().await.metrics_port;
    let server_state_for_task = Arc::clone(&server_state);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(server_port, server_state_for_task).await {
            error!("HTTP server error: {}", e);
        }
    });
    wait_for_server_ready(&server_state, &server_handle, &server_config).await?;

    let client = Client::try_default().await?;

    let brokers = KubeBrokerRegistry::new(client.clone(), config.broker_request_timeout_duration())
        .context("Failed to build broker HTTP client")?;
    let reconciler = Reconciler::new(
        Arc::new(KubeCatalog::new(client.clone())),
        Arc::new(brokers),
        Arc::new(KubeSecretStore::new(client.clone())),
        Arc::new(KubeInstanceLookup::new(client.clone())),
        config,
    );
    let context = Arc::new(ControllerContext {
        client: client.clone(),
        reconciler,
    });

    reconcile_existing_resources(&context).await;

    info!("Controller initialized, starting watch loops...");

    Ok(InitializationResult {
        client,
        context,
        server_state,
        controller_config,
        server_config,
    })
}

/// Wait for the HTTP server to become ready
async fn wait_for_server_ready(
    server_state: &Arc<ServerState>,
    server_handle: &tokio::task::JoinHandle<()>,
    server_config: &SharedServerConfig,
) -> Result<()> {
    let config = server_config.read().await;
    let startup_timeout = config.startup_timeout_duration();
    let poll_interval = config.poll_interval_duration();
    drop(config);
    let start_time = std::time::Instant::now();

    loop {
        if server_handle.is_finished() {
            return Err(anyhow::anyhow!("HTTP server failed to start"));
        }
        if server_state.ready() {
            info!("HTTP server is ready and accepting connections");
            return Ok(());
        }
        if start_time.elapsed() > startup_timeout {
            return Err(anyhow::anyhow!(
                "HTTP server failed to become ready within {} seconds",
                startup_timeout.as_secs()
            ));
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// Log how many resources of a kind exist per namespace
fn log_resource_summary(kind: &str, items: impl Iterator<Item = (String, String)>) {
    let mut by_namespace: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut total = 0usize;
    for (namespace, name) in items {
        by_namespace.entry(namespace).or_default().push(name);
        total += 1;
    }
    if total == 0 {
        return;
    }

    info!("Service Catalog Controller - Startup Resource Summary");
    info!("Resource Kind: {}", kind);
    info!("Total Resources: {}", total);
    info!("Namespaces: {}", by_namespace.len());
    for (namespace, mut names) in by_namespace {
        names.sort();
        let listed = if names.len() <= 3 {
            names.join(", ")
        } else {
            format!("{}, ... ({} total)", names[..3].join(", "), names.len())
        };
        info!("Namespace: {}", namespace);
        info!("  Resources ({}): {}", names.len(), listed);
    }
}

/// Reconcile resources that existed before the controller started
///
/// Failures are logged; the watch picks the resources up again.
async fn reconcile_existing_resources(context: &Arc<ControllerContext>) {
    let span = tracing::span!(
        tracing::Level::INFO,
        "controller.startup.reconcile_existing",
        operation = "reconcile_existing_resources"
    );
    async move {
        reconcile_existing_instances(context).await;
        reconcile_existing_bindings(context).await;
    }
    .instrument(span)
    .await;
}

async fn reconcile_existing_instances(context: &Arc<ControllerContext>) {
    let instances: Api<ServiceInstance> = Api::all(context.client.clone());
    match instances.list(&ListParams::default()).await {
        Ok(list) => {
            info!(
                "CRD is queryable, found {} existing ServiceInstance resources",
                list.items.len()
            );
            log_resource_summary(
                "ServiceInstance",
                list.items
                    .iter()
                    .map(|item| (item.namespace().unwrap_or_default(), item.name_any())),
            );
            for item in list.items {
                let name = item.name_any();
                let namespace = item.namespace().unwrap_or_default();
                match reconcile_instance_resource(Arc::new(item), Arc::clone(context)).await {
                    Ok(_) => info!(
                        resource.name = name.as_str(),
                        resource.namespace = namespace.as_str(),
                        "startup.instance.reconciled"
                    ),
                    Err(e) => warn!(
                        "Startup reconciliation of ServiceInstance {}/{} failed, the watch will retry: {}",
                        namespace, name, e
                    ),
                }
            }
        }
        Err(e) => warn!(
            "ServiceInstance CRD is not queryable yet ({}); is it installed? Continuing with the watch",
            e
        ),
    }
}

async fn reconcile_existing_bindings(context: &Arc<ControllerContext>) {
    let bindings: Api<ServiceBinding> = Api::all(context.client.clone());
    match bindings.list(&ListParams::default()).await {
        Ok(list) => {
            info!(
                "CRD is queryable, found {} existing ServiceBinding resources",
                list.items.len()
            );
            log_resource_summary(
                "ServiceBinding",
                list.items
                    .iter()
                    .map(|item| (item.namespace().unwrap_or_default(), item.name_any())),
            );
            for item in list.items {
                let name = item.name_any();
                let namespace = item.namespace().unwrap_or_default();
                match reconcile_binding_resource(Arc::new(item), Arc::clone(context)).await {
                    Ok(_) => info!(
                        resource.name = name.as_str(),
                        resource.namespace = namespace.as_str(),
                        "startup.binding.reconciled"
                    ),
                    Err(e) => warn!(
                        "Startup reconciliation of ServiceBinding {}/{} failed, the watch will retry: {}",
                        namespace, name, e
                    ),
                }
            }
        }
        Err(e) => warn!(
            "ServiceBinding CRD is not queryable yet ({}); is it installed? Continuing with the watch",
            e
        ),
    }
}
