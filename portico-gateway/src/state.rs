//! Shared gateway state handed to every handler and background task.

use std::sync::Arc;

use crate::config::Config;
use crate::tunnel::registry::TunnelRegistry;

#[derive(Clone)]
pub struct GatewayContext {
    pub config: Arc<Config>,
    pub registry: Arc<TunnelRegistry>,
}

impl GatewayContext {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            registry: Arc::new(TunnelRegistry::new()),
        }
    }
}
