//! # Service Catalog Controller
//!
//! Watches `ServiceInstance` and `ServiceBinding` resources in all namespaces and
//! drives them to their desired state through the Open Service Broker API.

use anyhow::Result;
use service_catalog_controller::runtime::{initialization::initialize, watch_loop::run_watch_loop};

#[tokio::main]
async fn main() -> Result<()> {
    let init = initialize().await?;
    run_watch_loop(init.context, init.server_state, init.controller_config).await
}
