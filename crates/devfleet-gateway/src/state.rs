//! Gateway application state.

use std::sync::Arc;

use devfleet_agent::{ColdResetCoordinator, FleetWatcher};

use crate::config::GatewayConfig;

/// Shared application state for the gateway.
#[derive(Clone)]
pub struct GatewayState {
    /// Attached devices.
    pub fleet: Arc<FleetWatcher>,
    /// Cold reset entry point.
    pub coordinator: Arc<ColdResetCoordinator>,
    /// Gateway configuration.
    pub config: GatewayConfig,
}

impl GatewayState {
    /// Create a new gateway state.
    #[must_use]
    pub const fn new(
        fleet: Arc<FleetWatcher>,
        coordinator: Arc<ColdResetCoordinator>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            fleet,
            coordinator,
            config,
        }
    }
}
