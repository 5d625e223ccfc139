//! State shared by every HTTP and WebSocket handler.

use std::sync::Arc;

use crate::config::Config;
use crate::orchestrator::{ConnectionRegistry, Orchestrator};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub registry: Arc<ConnectionRegistry>,
    /// Read-only after startup.
    pub config: Arc<Config>,
}

impl AppState {
    /// Builds the orchestrator and its collaborators from configuration.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let registry = Arc::new(ConnectionRegistry::new());
        let orchestrator = Arc::new(Orchestrator::from_config(&config, registry.clone())?);
        Ok(Self { orchestrator, registry, config: Arc::new(config) })
    }
}
