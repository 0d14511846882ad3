//! # Configuration
//!
//! Controller and server configuration, loaded from environment variables.
//!
//! - `controller`: reconciliation, retry and polling settings
//! - `server`: metrics and probe server settings

pub mod controller;
pub mod server;

pub use controller::ControllerConfig;
pub use server::ServerConfig;

use std::sync::Arc;
use tokio::sync::RwLock;

/// Controller configuration shared between the watch loops and the reconcilers
pub type SharedControllerConfig = Arc<RwLock<ControllerConfig>>;

/// Server configuration shared with startup
pub type SharedServerConfig = Arc<RwLock<ServerConfig>>;

/// Load both configurations from the environment and wrap them for sharing
#[must_use]
pub fn create_shared_config() -> (SharedControllerConfig, SharedServerConfig) {
    (
        Arc::new(RwLock::new(ControllerConfig::from_env())),
        Arc::new(RwLock::new(ServerConfig::from_env())),
    )
}
