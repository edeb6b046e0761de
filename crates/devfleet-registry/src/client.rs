//! Heartbeat client: persistent registration and device state reporting.
//!
//! [`HeartbeatClient::report_device_state`] never blocks on the network. It
//! records the update in a latest-known table and queues it for a background
//! worker that owns the registry link. When the link breaks the worker
//! reconnects with backoff and re-announces every tracked device once, so no
//! update is lost across an outage.

use std::collections::BTreeMap;
use std::sync::Arc;

use devfleet_core::{DeviceId, DeviceUpdate};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::ReconnectBackoff;
use crate::config::HeartbeatConfig;
use crate::error::{RegistryError, Result};
use crate::transport::{Handshake, RegistryConnector, RegistryLink, Session};
use crate::ws::WsConnector;

/// State shared between the client handle and its worker.
#[derive(Default)]
struct Shared {
    tracked: Mutex<BTreeMap<DeviceId, DeviceUpdate>>,
    session: RwLock<Option<Session>>,
}

/// The provider's registration with the central registry.
pub struct HeartbeatClient {
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<DeviceUpdate>,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    self_url: String,
}

impl HeartbeatClient {
    /// Connect to the registry over its heartbeat WebSocket.
    ///
    /// # Errors
    ///
    /// See [`HeartbeatClient::connect`].
    pub async fn connect_ws(config: HeartbeatConfig) -> Result<Self> {
        let connector = Arc::new(WsConnector::new(&config.registry_addr));
        Self::connect(connector, config).await
    }

    /// Perform the handshake and start the background worker.
    ///
    /// The handshake is retried with exponential backoff up to
    /// `config.connect_attempts` times.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::Unreachable` when the attempt budget is spent,
    /// or `RegistryError::HandshakeRejected` as soon as the registry refuses.
    pub async fn connect(
        connector: Arc<dyn RegistryConnector>,
        config: HeartbeatConfig,
    ) -> Result<Self> {
        let handshake = Handshake {
            name: config.name.clone(),
            owner: config.owner.clone(),
            secret: config.secret.clone(),
            url: config.self_url.clone(),
            priority: config.priority,
        };

        let link = initial_connect(connector.as_ref(), &handshake, &config).await?;
        info!(
            registry = %config.registry_addr,
            session = %link.session().id,
            "Registered with registry"
        );

        let shared = Arc::new(Shared::default());
        *shared.session.write() = Some(link.session().clone());

        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let worker = Worker {
            connector,
            handshake,
            platform: config.platform,
            backoff: config.backoff,
            ping_interval: config.ping_interval,
            shared: Arc::clone(&shared),
            rx,
            shutdown: shutdown.clone(),
        };
        let handle = tokio::spawn(worker.run(link));

        Ok(Self {
            shared,
            tx,
            shutdown,
            worker: Mutex::new(Some(handle)),
            self_url: config.self_url,
        })
    }

    /// Like [`HeartbeatClient::connect_until_cancelled`], over the heartbeat
    /// WebSocket.
    ///
    /// # Errors
    ///
    /// See [`HeartbeatClient::connect_until_cancelled`].
    pub async fn connect_ws_until_cancelled(
        config: HeartbeatConfig,
        cancel: &CancellationToken,
    ) -> Result<Option<Self>> {
        let connector = Arc::new(WsConnector::new(&config.registry_addr));
        Self::connect_until_cancelled(connector, config, cancel).await
    }

    /// Connect, starting a fresh attempt budget each time one is spent.
    ///
    /// An unreachable registry is waited out. Returns `Ok(None)` once
    /// `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::HandshakeRejected` when the registry refuses
    /// the provider.
    pub async fn connect_until_cancelled(
        connector: Arc<dyn RegistryConnector>,
        config: HeartbeatConfig,
        cancel: &CancellationToken,
    ) -> Result<Option<Self>> {
        let pause = config.backoff.delay_for_attempt(config.connect_attempts);
        let mut round = 0u32;
        loop {
            round = round.saturating_add(1);
            let attempt = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(None),
                result = Self::connect(Arc::clone(&connector), config.clone()) => result,
            };
            match attempt {
                Ok(client) => return Ok(Some(client)),
                Err(e @ RegistryError::Unreachable { .. }) => {
                    warn!(round, error = %e, "Registry unreachable, still waiting");
                }
                Err(e) => return Err(e),
            }
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(None),
                () = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// Report the latest state of a device.
    ///
    /// The update is merged into the latest-known record for the device and
    /// queued for delivery. Delivery is at-least-once: if the link is down the
    /// record is re-sent after reconnection.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::NotConnected` after [`HeartbeatClient::shutdown`].
    pub fn report_device_state(&self, update: DeviceUpdate) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(RegistryError::NotConnected);
        }

        {
            let mut tracked = self.shared.tracked.lock();
            match tracked.get_mut(&update.udid) {
                Some(latest) => latest.merge(update.clone()),
                None => {
                    tracked.insert(update.udid.clone(), update.clone());
                }
            }
        }

        self.tx.send(update).map_err(|_| RegistryError::NotConnected)
    }

    /// Withdraw a device: announce it offline and stop re-announcing it.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::NotConnected` after [`HeartbeatClient::shutdown`].
    pub fn forget_device(&self, udid: &DeviceId) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(RegistryError::NotConnected);
        }
        self.shared.tracked.lock().remove(udid);
        self.tx
            .send(DeviceUpdate::offline(udid.clone()))
            .map_err(|_| RegistryError::NotConnected)
    }

    /// Devices that will be re-announced after a reconnect.
    #[must_use]
    pub fn tracked_devices(&self) -> Vec<DeviceId> {
        self.shared.tracked.lock().keys().cloned().collect()
    }

    /// Latest known record for a device.
    #[must_use]
    pub fn latest(&self, udid: &DeviceId) -> Option<DeviceUpdate> {
        self.shared.tracked.lock().get(udid).cloned()
    }

    /// Current session, or `None` while reconnecting.
    #[must_use]
    pub fn session(&self) -> Option<Session> {
        self.shared.session.read().clone()
    }

    /// Returns true while a session is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.session.read().is_some()
    }

    /// URL announced to the registry for this provider.
    #[must_use]
    pub fn self_url(&self) -> &str {
        &self.self_url
    }

    /// Stop the worker and close the session.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Heartbeat worker ended abnormally");
            }
        }
        *self.shared.session.write() = None;
    }
}

impl Drop for HeartbeatClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn initial_connect(
    connector: &dyn RegistryConnector,
    handshake: &Handshake,
    config: &HeartbeatConfig,
) -> Result<Box<dyn RegistryLink>> {
    let attempts = config.connect_attempts.max(1);
    for attempt in 0..attempts {
        match connector.connect(handshake).await {
            Ok(link) => return Ok(link),
            Err(e) if !e.is_retriable() => return Err(e),
            Err(e) => {
                warn!(
                    registry = %config.registry_addr,
                    attempt = attempt + 1,
                    error = %e,
                    "Registry handshake failed"
                );
            }
        }
        if attempt + 1 < attempts {
            tokio::time::sleep(config.backoff.delay_for_attempt(attempt)).await;
        }
    }
    Err(RegistryError::Unreachable {
        address: config.registry_addr.clone(),
        attempts,
    })
}

/// Owns the registry link. Serializes all writes.
struct Worker {
    connector: Arc<dyn RegistryConnector>,
    handshake: Handshake,
    platform: String,
    backoff: ReconnectBackoff,
    ping_interval: std::time::Duration,
    shared: Arc<Shared>,
    rx: mpsc::UnboundedReceiver<DeviceUpdate>,
    shutdown: CancellationToken,
}

impl Worker {
    async fn run(mut self, mut link: Box<dyn RegistryLink>) {
        let mut ping = tokio::time::interval(self.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ping.tick().await;

        loop {
            let (error, unsent) = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                next = self.rx.recv() => {
                    let Some(update) = next else { break };
                    match link.send_update(&self.platform, &update).await {
                        Ok(()) => {
                            debug!(udid = %update.udid, "Device update delivered");
                            continue;
                        }
                        Err(e) => (e, Some(update)),
                    }
                }
                _ = ping.tick() => match link.ping().await {
                    Ok(()) => continue,
                    Err(e) => (e, None),
                },
            };

            warn!(
                session = %link.session().id,
                error = %error,
                "Registry connection lost"
            );
            *self.shared.session.write() = None;

            match self.recover(unsent).await {
                Some(new_link) => link = new_link,
                None => break,
            }
        }

        debug!("Heartbeat worker stopped");
    }

    /// Reconnect and resynchronize. Returns `None` on shutdown.
    async fn recover(&mut self, unsent: Option<DeviceUpdate>) -> Option<Box<dyn RegistryLink>> {
        // Updates for untracked devices are withdrawals the re-announce
        // does not cover. Everything else is superseded by the snapshot.
        let mut pending: Vec<DeviceUpdate> = unsent.into_iter().collect();

        loop {
            let mut link = self.reconnect().await?;
            self.collect_withdrawals(&mut pending);

            match self.resync(link.as_mut(), &mut pending).await {
                Ok(announced) => {
                    *self.shared.session.write() = Some(link.session().clone());
                    info!(
                        session = %link.session().id,
                        announced,
                        "Re-registered with registry"
                    );
                    return Some(link);
                }
                Err(e) => {
                    warn!(error = %e, "Resync after reconnect failed");
                }
            }
        }
    }

    fn collect_withdrawals(&mut self, pending: &mut Vec<DeviceUpdate>) {
        while let Ok(update) = self.rx.try_recv() {
            pending.push(update);
        }
        let tracked = self.shared.tracked.lock();
        pending.retain(|update| !tracked.contains_key(&update.udid));
    }

    /// Re-announce every tracked device, then flush pending withdrawals.
    async fn resync(
        &self,
        link: &mut dyn RegistryLink,
        pending: &mut Vec<DeviceUpdate>,
    ) -> Result<usize> {
        let snapshot: Vec<DeviceUpdate> = self.shared.tracked.lock().values().cloned().collect();
        for update in &snapshot {
            link.send_update(&self.platform, update).await?;
        }
        while let Some(update) = pending.first() {
            link.send_update(&self.platform, update).await?;
            pending.remove(0);
        }
        Ok(snapshot.len())
    }

    async fn reconnect(&self) -> Option<Box<dyn RegistryLink>> {
        let mut attempt: u32 = 0;
        loop {
            let delay = self.backoff.delay_for_attempt(attempt);
            debug!(
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                attempt = attempt + 1,
                "Reconnecting to registry"
            );
            tokio::select! {
                () = self.shutdown.cancelled() => return None,
                () = tokio::time::sleep(delay) => {}
            }

            let result = tokio::select! {
                () = self.shutdown.cancelled() => return None,
                r = self.connector.connect(&self.handshake) => r,
            };
            match result {
                Ok(link) => return Some(link),
                Err(e) => {
                    warn!(attempt = attempt + 1, error = %e, "Registry reconnect failed");
                }
            }
            attempt = attempt.saturating_add(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockRegistry;
    use devfleet_core::{DeviceIdentity, DeviceInfo, DeviceProperties, ProviderEndpoint};
    use std::time::Duration;

    fn udid(s: &str) -> DeviceId {
        DeviceId::parse(s).unwrap()
    }

    fn test_config() -> HeartbeatConfig {
        let mut config = HeartbeatConfig::new("registry.test:4000", "apple", "http://10.0.0.2:3600");
        config.backoff = ReconnectBackoff::fixed(Duration::from_millis(5));
        config.ping_interval = Duration::from_millis(20);
        config.connect_attempts = 3;
        config
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    fn ready(id: &str, port: u16) -> DeviceUpdate {
        DeviceUpdate::ready(
            udid(id),
            ProviderEndpoint::new("10.0.0.2", port),
            DeviceProperties::from_parts(&DeviceIdentity::default(), "Apple", &DeviceInfo::default()),
        )
    }

    #[tokio::test]
    async fn connect_assigns_session() {
        let registry = MockRegistry::new();
        let client = HeartbeatClient::connect(Arc::new(registry.clone()), test_config())
            .await
            .unwrap();

        assert_eq!(client.session().unwrap().id, "mock-session-1");
        assert!(client.is_connected());
        assert_eq!(client.self_url(), "http://10.0.0.2:3600");
        assert_eq!(registry.handshakes()[0].url, "http://10.0.0.2:3600");
        client.shutdown().await;
    }

    #[tokio::test]
    async fn connect_retries_then_succeeds() {
        let registry = MockRegistry::new();
        registry.refuse_next_connects(2);

        let client = HeartbeatClient::connect(Arc::new(registry.clone()), test_config())
            .await
            .unwrap();
        assert_eq!(registry.connect_attempts(), 3);
        client.shutdown().await;
    }

    #[tokio::test]
    async fn connect_gives_up_when_unreachable() {
        let registry = MockRegistry::new();
        registry.refuse_next_connects(10);

        let err = HeartbeatClient::connect(Arc::new(registry.clone()), test_config())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RegistryError::Unreachable { attempts: 3, .. }));
        assert_eq!(registry.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn outage_at_startup_is_waited_out() {
        let registry = MockRegistry::new();
        registry.refuse_next_connects(7);
        let cancel = CancellationToken::new();

        let client =
            HeartbeatClient::connect_until_cancelled(Arc::new(registry.clone()), test_config(), &cancel)
                .await
                .unwrap()
                .unwrap();

        assert_eq!(registry.connect_attempts(), 8);
        assert!(client.is_connected());
        client.shutdown().await;
    }

    #[tokio::test]
    async fn waiting_for_registry_stops_on_cancel() {
        let registry = MockRegistry::new();
        registry.refuse_next_connects(u32::MAX);
        let cancel = CancellationToken::new();
        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(40)).await;
                cancel.cancel();
            })
        };

        let outcome =
            HeartbeatClient::connect_until_cancelled(Arc::new(registry.clone()), test_config(), &cancel)
                .await
                .unwrap();

        assert!(outcome.is_none());
        assert!(registry.connect_attempts() > 3);
        canceller.await.unwrap();
    }

    #[tokio::test]
    async fn rejected_handshake_is_not_retried() {
        let registry = MockRegistry::new();
        registry.reject_handshakes("bad secret");

        let err = HeartbeatClient::connect(Arc::new(registry.clone()), test_config())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RegistryError::HandshakeRejected(_)));
        assert_eq!(registry.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn reports_are_delivered_in_order() {
        let registry = MockRegistry::new();
        let client = HeartbeatClient::connect(Arc::new(registry.clone()), test_config())
            .await
            .unwrap();

        let identity = DeviceIdentity::default();
        client
            .report_device_state(DeviceUpdate::preparing(udid("ABC123"), &identity, "Apple"))
            .unwrap();
        client.report_device_state(ready("ABC123", 20001)).unwrap();

        wait_until(|| registry.updates().len() == 2).await;
        let updates = registry.updates();
        assert!(updates[0].provider.is_none());
        assert_eq!(
            updates[1].provider.as_ref().unwrap().wda_url,
            "http://10.0.0.2:20001"
        );
        assert_eq!(registry.platforms(), vec!["apple".to_string(); 2]);
        client.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_reports_are_tolerated() {
        let registry = MockRegistry::new();
        let client = HeartbeatClient::connect(Arc::new(registry.clone()), test_config())
            .await
            .unwrap();

        client.report_device_state(ready("A", 20001)).unwrap();
        client.report_device_state(ready("A", 20001)).unwrap();

        wait_until(|| registry.updates().len() == 2).await;
        assert_eq!(client.tracked_devices(), vec![udid("A")]);
        client.shutdown().await;
    }

    #[tokio::test]
    async fn reconnect_reannounces_each_tracked_device_once() {
        let registry = MockRegistry::new();
        let client = HeartbeatClient::connect(Arc::new(registry.clone()), test_config())
            .await
            .unwrap();

        client.report_device_state(ready("A", 20001)).unwrap();
        client.report_device_state(ready("B", 20002)).unwrap();
        client.report_device_state(ready("A", 20003)).unwrap();
        wait_until(|| registry.updates().len() == 3).await;

        registry.drop_connection();
        wait_until(|| registry.session_count() == 2 && registry.updates_in_session(2).len() == 2)
            .await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        let reannounced = registry.updates_in_session(2);
        assert_eq!(reannounced.len(), 2);
        let a = reannounced.iter().find(|u| u.udid == udid("A")).unwrap();
        assert_eq!(
            a.provider.as_ref().unwrap().wda_url,
            "http://10.0.0.2:20003"
        );
        assert!(reannounced.iter().any(|u| u.udid == udid("B")));
        assert_eq!(client.session().unwrap().id, "mock-session-2");
        client.shutdown().await;
    }

    #[tokio::test]
    async fn update_sent_during_outage_is_not_dropped() {
        let registry = MockRegistry::new();
        let client = HeartbeatClient::connect(Arc::new(registry.clone()), test_config())
            .await
            .unwrap();

        registry.drop_connection();
        registry.refuse_next_connects(3);
        client.report_device_state(ready("A", 20001)).unwrap();

        wait_until(|| !registry.updates_in_session(2).is_empty()).await;
        let delivered = registry.updates_in_session(2);
        assert_eq!(delivered[0].udid, udid("A"));
        client.shutdown().await;
    }

    #[tokio::test]
    async fn forgotten_device_is_withdrawn_and_not_reannounced() {
        let registry = MockRegistry::new();
        let client = HeartbeatClient::connect(Arc::new(registry.clone()), test_config())
            .await
            .unwrap();

        client.report_device_state(ready("A", 20001)).unwrap();
        client.report_device_state(ready("B", 20002)).unwrap();
        client.forget_device(&udid("B")).unwrap();
        wait_until(|| registry.updates().len() == 3).await;
        assert!(registry.updates()[2].provider.is_none());

        registry.drop_connection();
        wait_until(|| registry.updates_in_session(2).len() == 1).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        let reannounced = registry.updates_in_session(2);
        assert_eq!(reannounced.len(), 1);
        assert_eq!(reannounced[0].udid, udid("A"));
        client.shutdown().await;
    }

    #[tokio::test]
    async fn withdrawal_during_outage_survives_reconnect() {
        let registry = MockRegistry::new();
        let client = HeartbeatClient::connect(Arc::new(registry.clone()), test_config())
            .await
            .unwrap();

        client.report_device_state(ready("A", 20001)).unwrap();
        wait_until(|| registry.updates().len() == 1).await;

        registry.drop_connection();
        client.forget_device(&udid("A")).unwrap();

        wait_until(|| registry.updates_in_session(2).len() == 1).await;
        let delivered = registry.updates_in_session(2);
        assert_eq!(delivered[0].udid, udid("A"));
        assert!(delivered[0].provider.is_none());
        client.shutdown().await;
    }

    #[tokio::test]
    async fn keepalive_pings_are_sent() {
        let registry = MockRegistry::new();
        let client = HeartbeatClient::connect(Arc::new(registry.clone()), test_config())
            .await
            .unwrap();

        wait_until(|| registry.ping_count() >= 2).await;
        assert_eq!(registry.session_count(), 1);
        client.shutdown().await;
    }

    #[tokio::test]
    async fn reports_fail_after_shutdown() {
        let registry = MockRegistry::new();
        let client = HeartbeatClient::connect(Arc::new(registry.clone()), test_config())
            .await
            .unwrap();

        client.shutdown().await;
        assert!(!client.is_connected());
        assert!(matches!(
            client.report_device_state(ready("A", 1)),
            Err(RegistryError::NotConnected)
        ));
    }
}
