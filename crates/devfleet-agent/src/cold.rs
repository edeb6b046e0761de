//! Cold reset coordination.
//!
//! A cold reset restarts a device's endpoint on a fresh port and keeps the
//! registry informed: the device is marked `colding` with no endpoint while
//! the restart runs, then re-announced with its new address or withdrawn.

use std::sync::Arc;

use devfleet_core::{DeviceId, DeviceProperties, DeviceState, DeviceUpdate, ProviderEndpoint};
use devfleet_registry::HeartbeatClient;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{AgentError, Result};
use crate::fleet::FleetWatcher;
use crate::lifecycle::can_cold_reset;

/// Result of a cold reset attempt that reached the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColdResetOutcome {
    /// Whether the device came back Ready.
    pub success: bool,
    /// Human-readable summary.
    pub description: String,
}

/// Runs cold resets against the fleet and publishes their progress.
pub struct ColdResetCoordinator {
    fleet: Arc<FleetWatcher>,
    heartbeat: Arc<HeartbeatClient>,
    public_host: String,
    brand: String,
}

impl ColdResetCoordinator {
    /// Create a coordinator announcing endpoints on `public_host`.
    #[must_use]
    pub fn new(
        fleet: Arc<FleetWatcher>,
        heartbeat: Arc<HeartbeatClient>,
        public_host: impl Into<String>,
        brand: impl Into<String>,
    ) -> Self {
        Self {
            fleet,
            heartbeat,
            public_host: public_host.into(),
            brand: brand.into(),
        }
    }

    /// Cold reset one device.
    ///
    /// Endpoint failures are reported in the outcome, not as errors.
    ///
    /// # Errors
    ///
    /// Returns `DeviceNotFound` for an untracked udid, `InvalidTransition`
    /// when the device is still preparing, or a registry error if the
    /// heartbeat client is shut down.
    pub async fn reset(&self, udid: &DeviceId) -> Result<ColdResetOutcome> {
        let lifecycle = self
            .fleet
            .get(udid)
            .ok_or_else(|| AgentError::DeviceNotFound(udid.clone()))?;

        let state = lifecycle.state();
        if !can_cold_reset(state) {
            return Err(AgentError::InvalidTransition {
                udid: udid.clone(),
                from: state,
                to: DeviceState::Preparing,
            });
        }

        info!(udid = %udid, "Cold reset requested");
        self.heartbeat
            .report_device_state(DeviceUpdate::offline(udid.clone()).with_colding(true))?;

        match lifecycle.cold_restart().await {
            Ok((port, info)) => {
                let endpoint = ProviderEndpoint::new(&self.public_host, port);
                let properties =
                    DeviceProperties::from_parts(&lifecycle.snapshot().identity, &self.brand, &info);
                self.heartbeat.report_device_state(
                    DeviceUpdate::ready(udid.clone(), endpoint, properties).with_colding(false),
                )?;
                Ok(ColdResetOutcome {
                    success: true,
                    description: "Device successfully colded".to_string(),
                })
            }
            Err(AgentError::Cancelled(_)) => {
                warn!(udid = %udid, "Device removed during cold reset");
                Ok(ColdResetOutcome {
                    success: false,
                    description: format!("udid: {udid} was unplugged during reset"),
                })
            }
            Err(e) if e.is_device_failure() => {
                self.heartbeat
                    .report_device_state(DeviceUpdate::offline(udid.clone()).with_colding(false))?;
                Ok(ColdResetOutcome {
                    success: false,
                    description: e.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointFactory;
    use crate::mock::{MockEndpointFactory, RecordingObserver};
    use crate::observer::StatusObserver;
    use crate::ports::ProxyPortAllocator;
    use devfleet_core::PresenceEvent;
    use devfleet_registry::{HeartbeatConfig, MockRegistry, ReconnectBackoff};
    use std::time::Duration;

    struct Harness {
        registry: MockRegistry,
        factory: Arc<MockEndpointFactory>,
        fleet: Arc<FleetWatcher>,
        coordinator: ColdResetCoordinator,
    }

    async fn harness(range: std::ops::Range<u16>) -> Harness {
        let registry = MockRegistry::new();
        let mut config = HeartbeatConfig::new("localhost:4000", "apple", "http://10.0.0.2:3600");
        config.backoff = ReconnectBackoff::fixed(Duration::from_millis(5));
        let heartbeat = Arc::new(
            HeartbeatClient::connect(Arc::new(registry.clone()), config)
                .await
                .unwrap(),
        );

        let factory = Arc::new(MockEndpointFactory::new());
        let fleet = Arc::new(FleetWatcher::new(
            ProxyPortAllocator::new(range, 100),
            Arc::clone(&factory) as Arc<dyn EndpointFactory>,
            Arc::new(RecordingObserver::new()) as Arc<dyn StatusObserver>,
        ));
        let coordinator = ColdResetCoordinator::new(Arc::clone(&fleet), heartbeat, "10.0.0.2", "Apple");

        Harness {
            registry,
            factory,
            fleet,
            coordinator,
        }
    }

    async fn plug_ready(harness: &Harness, raw: &str) -> DeviceId {
        let udid = DeviceId::parse(raw).unwrap();
        harness.fleet.handle_event(PresenceEvent::plugged(raw)).await;
        for _ in 0..400 {
            if harness.fleet.get(&udid).map(|l| l.state()) == Some(DeviceState::Ready) {
                return udid;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("{raw} never became ready");
    }

    async fn updates_for(harness: &Harness, udid: &DeviceId, count: usize) -> Vec<DeviceUpdate> {
        for _ in 0..400 {
            let updates = harness.registry.updates_for(udid);
            if updates.len() >= count {
                return updates;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("registry never saw {count} updates for {udid}");
    }

    #[tokio::test]
    async fn unknown_device() {
        let harness = harness(46600..46620).await;
        let err = harness
            .coordinator
            .reset(&DeviceId::parse("ZZZ999").unwrap())
            .await
            .unwrap_err();

        assert!(matches!(err, AgentError::DeviceNotFound(_)));
        assert_eq!(err.to_string(), "udid: ZZZ999 not found");
    }

    #[tokio::test]
    async fn successful_reset_publishes_new_endpoint() {
        let harness = harness(46620..46640).await;
        let udid = plug_ready(&harness, "ABC123").await;
        let before = harness.fleet.get(&udid).unwrap().public_port();

        let outcome = harness.coordinator.reset(&udid).await.unwrap();
        assert!(outcome.success);

        let after = harness.fleet.get(&udid).unwrap().public_port();
        assert_ne!(after, before);

        let updates = updates_for(&harness, &udid, 2).await;
        assert_eq!(updates[0].colding, Some(true));
        assert!(updates[0].provider.is_none());
        let last = updates.last().unwrap();
        assert_eq!(last.colding, Some(false));
        assert_eq!(
            last.provider.as_ref().unwrap().wda_url,
            format!("http://10.0.0.2:{after}")
        );
        let properties = last.properties.as_ref().unwrap();
        assert_eq!(properties.name.as_deref(), Some("iPhone ABC123"));
        assert_eq!(properties.brand.as_deref(), Some("Apple"));
    }

    #[tokio::test]
    async fn failed_reset_withdraws_device() {
        let harness = harness(46640..46660).await;
        let udid = plug_ready(&harness, "FLAKY1").await;
        harness
            .factory
            .endpoint(&udid)
            .unwrap()
            .set_fail_healthcheck(true);

        let outcome = harness.coordinator.reset(&udid).await.unwrap();

        assert!(!outcome.success);
        assert!(outcome.description.contains("healthcheck failed"));
        assert_eq!(
            harness.fleet.get(&udid).unwrap().state(),
            DeviceState::Fatal
        );
        let updates = updates_for(&harness, &udid, 2).await;
        let last = updates.last().unwrap();
        assert_eq!(last.colding, Some(false));
        assert!(last.provider.is_none());
    }

    #[tokio::test]
    async fn reset_refused_while_preparing() {
        let harness = harness(46660..46680).await;
        let udid = DeviceId::parse("HANG01").unwrap();
        harness.factory.hang_healthcheck_for(&udid);
        harness
            .fleet
            .handle_event(PresenceEvent::plugged("HANG01"))
            .await;

        let err = harness.coordinator.reset(&udid).await.unwrap_err();
        assert!(matches!(err, AgentError::InvalidTransition { .. }));
        assert!(harness.registry.updates_for(&udid).iter().all(|u| u.colding != Some(true)));

        harness.fleet.shutdown().await;
    }
}
