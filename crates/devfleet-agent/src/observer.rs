//! Device status observation.
//!
//! Every lifecycle reports its transitions to a [`StatusObserver`]. The
//! production observer, [`HeartbeatObserver`], turns them into registry
//! records.

use std::sync::Arc;

use async_trait::async_trait;
use devfleet_core::{
    DeviceId, DeviceIdentity, DeviceInfo, DeviceProperties, DeviceState, DeviceUpdate,
    ProviderEndpoint,
};
use devfleet_registry::HeartbeatClient;
use tracing::warn;

/// A lifecycle transition as seen by observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    /// The device was attached and its endpoint is being prepared.
    Preparing {
        /// Name and product of the device.
        identity: DeviceIdentity,
    },
    /// The endpoint passed its healthcheck.
    Ready {
        /// Name and product of the device.
        identity: DeviceIdentity,
        /// Local port the endpoint is published on.
        public_port: u16,
        /// Attributes reported by the healthcheck.
        info: DeviceInfo,
    },
    /// The endpoint could not be brought up.
    Fatal {
        /// What went wrong.
        reason: String,
    },
}

impl StatusEvent {
    /// The state this event moves the device into.
    #[must_use]
    pub const fn state(&self) -> DeviceState {
        match self {
            Self::Preparing { .. } => DeviceState::Preparing,
            Self::Ready { .. } => DeviceState::Ready,
            Self::Fatal { .. } => DeviceState::Fatal,
        }
    }
}

/// Receives lifecycle transitions.
#[async_trait]
pub trait StatusObserver: Send + Sync {
    /// Called once per transition, in transition order per device.
    async fn on_status(&self, udid: &DeviceId, event: &StatusEvent);

    /// Called after an unplugged device has been torn down.
    async fn on_removed(&self, _udid: &DeviceId) {}
}

/// Publishes lifecycle transitions to the registry.
pub struct HeartbeatObserver {
    heartbeat: Arc<HeartbeatClient>,
    public_host: String,
    brand: String,
}

impl HeartbeatObserver {
    /// Create an observer announcing endpoints as `http://{public_host}:{port}`.
    #[must_use]
    pub fn new(
        heartbeat: Arc<HeartbeatClient>,
        public_host: impl Into<String>,
        brand: impl Into<String>,
    ) -> Self {
        Self {
            heartbeat,
            public_host: public_host.into(),
            brand: brand.into(),
        }
    }

    /// Registry record for a transition.
    #[must_use]
    pub fn record(&self, udid: &DeviceId, event: &StatusEvent) -> DeviceUpdate {
        match event {
            StatusEvent::Preparing { identity } => {
                DeviceUpdate::preparing(udid.clone(), identity, &self.brand)
            }
            StatusEvent::Ready {
                identity,
                public_port,
                info,
            } => DeviceUpdate::ready(
                udid.clone(),
                ProviderEndpoint::new(&self.public_host, *public_port),
                DeviceProperties::from_parts(identity, &self.brand, info),
            ),
            StatusEvent::Fatal { .. } => DeviceUpdate::offline(udid.clone()),
        }
    }
}

#[async_trait]
impl StatusObserver for HeartbeatObserver {
    async fn on_status(&self, udid: &DeviceId, event: &StatusEvent) {
        if let Err(e) = self.heartbeat.report_device_state(self.record(udid, event)) {
            warn!(udid = %udid, state = %event.state(), error = %e, "Failed to report device state");
        }
    }

    async fn on_removed(&self, udid: &DeviceId) {
        if let Err(e) = self.heartbeat.forget_device(udid) {
            warn!(udid = %udid, error = %e, "Failed to withdraw device");
        }
    }
}
