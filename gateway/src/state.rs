//! Application state for the gateway.

use std::sync::Arc;

use common::config::AppConfig;

use crate::connectors::{ConnectorRegistry, PoolSettings};
use crate::dispatcher::Dispatcher;
use crate::registry::ConnectionRegistry;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub connectors: Arc<ConnectorRegistry>,
    pub registry: Arc<ConnectionRegistry>,
    pub dispatcher: Dispatcher,
}

impl AppState {
    /// Creates the connector table, an empty connection registry and the
    /// dispatcher that ties them together.
    pub fn new(config: AppConfig) -> Self {
        let connectors = Arc::new(ConnectorRegistry::new(PoolSettings::from(&config)));
        let registry = Arc::new(ConnectionRegistry::new());
        let dispatcher = Dispatcher::new(connectors.clone(), registry.clone());

        Self {
            config,
            connectors,
            registry,
            dispatcher,
        }
    }
}
