//! Fleet watcher.
//!
//! Consumes presence events and keeps one [`DeviceLifecycle`] per attached
//! device. Events are handled one at a time: an unplug is fully torn down
//! before the next event is looked at.

use std::collections::HashMap;
use std::sync::Arc;

use devfleet_core::{DeviceId, PresenceEvent};
use futures::{Stream, StreamExt};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::device::{DeviceLifecycle, DeviceSnapshot};
use crate::endpoint::EndpointFactory;
use crate::observer::StatusObserver;
use crate::ports::ProxyPortAllocator;
use crate::serializer::StartupSerializer;

/// Registry of attached devices.
pub struct FleetWatcher {
    devices: RwLock<HashMap<DeviceId, Arc<DeviceLifecycle>>>,
    ports: Arc<ProxyPortAllocator>,
    serializer: StartupSerializer,
    endpoints: Arc<dyn EndpointFactory>,
    observer: Arc<dyn StatusObserver>,
}

impl FleetWatcher {
    /// Create an empty fleet.
    #[must_use]
    pub fn new(
        ports: Arc<ProxyPortAllocator>,
        endpoints: Arc<dyn EndpointFactory>,
        observer: Arc<dyn StatusObserver>,
    ) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            ports,
            serializer: StartupSerializer::new(),
            endpoints,
            observer,
        }
    }

    /// Handle presence events until the stream ends.
    pub async fn run<S>(&self, events: S)
    where
        S: Stream<Item = PresenceEvent> + Send,
    {
        futures::pin_mut!(events);
        while let Some(event) = events.next().await {
            self.handle_event(event).await;
        }
        warn!("Presence event stream ended");
    }

    /// Handle one presence event.
    pub async fn handle_event(&self, event: PresenceEvent) {
        if DeviceId::is_sentinel(&event.udid) {
            debug!(udid = %event.udid, "Ignoring placeholder device id");
            return;
        }
        let udid = match DeviceId::parse(&event.udid) {
            Ok(udid) => udid,
            Err(e) => {
                warn!(udid = %event.udid, error = %e, "Ignoring malformed device id");
                return;
            }
        };

        if event.present {
            self.attach(udid);
        } else {
            self.detach(&udid).await;
        }
    }

    fn attach(&self, udid: DeviceId) {
        let lifecycle = {
            let mut devices = self.devices.write();
            if devices.contains_key(&udid) {
                debug!(udid = %udid, "Device already tracked");
                return;
            }
            let lifecycle = DeviceLifecycle::new(
                udid.clone(),
                self.endpoints.create(&udid),
                Arc::clone(&self.ports),
                self.serializer.clone(),
                Arc::clone(&self.observer),
            );
            devices.insert(udid.clone(), Arc::clone(&lifecycle));
            lifecycle
        };

        info!(udid = %udid, "Device plugged");
        lifecycle.start();
    }

    async fn detach(&self, udid: &DeviceId) {
        let removed = self.devices.write().remove(udid);
        let Some(lifecycle) = removed else {
            debug!(udid = %udid, "Unplug for untracked device");
            return;
        };

        info!(udid = %udid, state = %lifecycle.state(), "Device unplugged");
        lifecycle.stop().await;
        self.observer.on_removed(udid).await;
    }

    /// Lifecycle of a tracked device.
    #[must_use]
    pub fn get(&self, udid: &DeviceId) -> Option<Arc<DeviceLifecycle>> {
        self.devices.read().get(udid).cloned()
    }

    /// Snapshots of every tracked device, sorted by udid.
    #[must_use]
    pub fn snapshots(&self) -> Vec<DeviceSnapshot> {
        let mut snapshots: Vec<_> = self
            .devices
            .read()
            .values()
            .map(|lifecycle| lifecycle.snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.udid.cmp(&b.udid));
        snapshots
    }

    /// Number of tracked devices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    /// Returns true when no device is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    /// The startup slot shared by every lifecycle.
    #[must_use]
    pub const fn serializer(&self) -> &StartupSerializer {
        &self.serializer
    }

    /// Stop every device and forget it.
    pub async fn shutdown(&self) {
        let devices: Vec<_> = self.devices.write().drain().collect();
        info!(count = devices.len(), "Stopping all devices");
        for (udid, lifecycle) in devices {
            lifecycle.stop().await;
            self.observer.on_removed(&udid).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockEndpointFactory, RecordingObserver};
    use devfleet_core::DeviceState;
    use std::time::Duration;

    fn fleet(range: std::ops::Range<u16>) -> (FleetWatcher, Arc<MockEndpointFactory>, Arc<RecordingObserver>) {
        let factory = Arc::new(MockEndpointFactory::new());
        let observer = Arc::new(RecordingObserver::new());
        let watcher = FleetWatcher::new(
            ProxyPortAllocator::new(range, 100),
            Arc::clone(&factory) as Arc<dyn EndpointFactory>,
            Arc::clone(&observer) as Arc<dyn StatusObserver>,
        );
        (watcher, factory, observer)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met in time");
    }

    fn udid(s: &str) -> DeviceId {
        DeviceId::parse(s).unwrap()
    }

    #[tokio::test]
    async fn plug_starts_lifecycle() {
        let (fleet, _, observer) = fleet(46400..46420);
        fleet.handle_event(PresenceEvent::plugged("ABC123")).await;

        assert_eq!(fleet.len(), 1);
        wait_until(|| observer.states_for(&udid("ABC123")).len() == 2).await;
        assert_eq!(
            fleet.get(&udid("ABC123")).unwrap().state(),
            DeviceState::Ready
        );
    }

    #[tokio::test]
    async fn duplicate_plug_ignored() {
        let (fleet, factory, observer) = fleet(46420..46440);
        fleet.handle_event(PresenceEvent::plugged("ABC123")).await;
        wait_until(|| observer.states_for(&udid("ABC123")).len() == 2).await;

        fleet.handle_event(PresenceEvent::plugged("ABC123")).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(fleet.len(), 1);
        assert_eq!(factory.endpoint(&udid("ABC123")).unwrap().start_count(), 1);
        assert_eq!(observer.events().len(), 2);
    }

    #[tokio::test]
    async fn unplug_removes_and_notifies() {
        let (fleet, _, observer) = fleet(46440..46460);
        fleet.handle_event(PresenceEvent::plugged("ABC123")).await;
        wait_until(|| observer.states_for(&udid("ABC123")).len() == 2).await;

        fleet.handle_event(PresenceEvent::unplugged("ABC123")).await;

        assert!(fleet.is_empty());
        assert!(fleet.get(&udid("ABC123")).is_none());
        assert_eq!(observer.removed(), vec![udid("ABC123")]);
    }

    #[tokio::test]
    async fn unplug_unknown_is_noop() {
        let (fleet, _, observer) = fleet(46460..46480);
        fleet.handle_event(PresenceEvent::unplugged("NOPE01")).await;

        assert!(fleet.is_empty());
        assert!(observer.removed().is_empty());
    }

    #[tokio::test]
    async fn sentinel_and_malformed_ids_ignored() {
        let (fleet, _, observer) = fleet(46480..46500);
        fleet
            .handle_event(PresenceEvent::plugged("ffffffffffffffffff0123"))
            .await;
        fleet.handle_event(PresenceEvent::plugged("bad id!")).await;

        assert!(fleet.is_empty());
        assert!(observer.events().is_empty());
    }

    #[tokio::test]
    async fn run_consumes_stream() {
        let (fleet, _, observer) = fleet(46500..46520);
        let events = futures::stream::iter(vec![
            PresenceEvent::plugged("AAA111"),
            PresenceEvent::plugged("BBB222"),
            PresenceEvent::unplugged("AAA111"),
        ]);

        fleet.run(events).await;

        assert_eq!(fleet.len(), 1);
        assert!(fleet.get(&udid("BBB222")).is_some());
        assert_eq!(observer.removed(), vec![udid("AAA111")]);
    }

    #[tokio::test]
    async fn snapshots_sorted() {
        let (fleet, _, _) = fleet(46520..46540);
        fleet.handle_event(PresenceEvent::plugged("ZZZ000")).await;
        fleet.handle_event(PresenceEvent::plugged("AAA000")).await;

        let ids: Vec<_> = fleet.snapshots().into_iter().map(|s| s.udid).collect();
        assert_eq!(ids, vec![udid("AAA000"), udid("ZZZ000")]);

        fleet.shutdown().await;
        assert!(fleet.is_empty());
    }
}
