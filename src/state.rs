//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::devices::DeviceManager;

/// Shared application state for the wrphub gateway.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// The connection lifecycle orchestrator; owns the registry and the
    /// transaction table.
    pub manager: DeviceManager,
}

impl AppState {
    #[must_use]
    pub fn new(config: Config) -> Self {
        let manager = DeviceManager::new(config.device_options());
        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            manager,
        }
    }
}
