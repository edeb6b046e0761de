//! Per-device lifecycle.
//!
//! A [`DeviceLifecycle`] owns one attached device from plug to unplug. On
//! [`start`](DeviceLifecycle::start) it spawns a task that waits for the
//! startup slot, leases a proxy port, starts the endpoint and healthchecks
//! it, then settles in `Ready` or `Fatal`. [`stop`](DeviceLifecycle::stop)
//! cancels whatever is in flight and releases every resource.
//!
//! Prepare and cold reset for the same device never overlap: both hold the
//! per-device operation lock for their whole run. Only the initial prepare
//! goes through the process-wide startup slot; a cold reset is operator
//! triggered and bypasses it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use devfleet_core::{DeviceId, DeviceIdentity, DeviceInfo, DeviceState};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::endpoint::DeviceEndpoint;
use crate::error::{AgentError, Result};
use crate::lifecycle::validate_transition;
use crate::observer::{StatusEvent, StatusObserver};
use crate::ports::{PortLease, ProxyPortAllocator};
use crate::serializer::StartupSerializer;

/// Point-in-time view of a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSnapshot {
    /// Device serial.
    pub udid: DeviceId,
    /// Current lifecycle state.
    pub state: DeviceState,
    /// Published proxy port. Non-zero exactly when `state` is `Ready`.
    pub public_port: u16,
    /// A cold reset is in progress.
    pub colding: bool,
    /// Name and product type.
    pub identity: DeviceIdentity,
    /// Attributes from the last successful healthcheck.
    pub properties: Option<DeviceInfo>,
    /// When the state last changed.
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle of one attached device.
pub struct DeviceLifecycle {
    udid: DeviceId,
    endpoint: Arc<dyn DeviceEndpoint>,
    ports: Arc<ProxyPortAllocator>,
    serializer: StartupSerializer,
    observer: Arc<dyn StatusObserver>,
    snapshot: RwLock<DeviceSnapshot>,
    lease: Mutex<Option<PortLease>>,
    ops: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceLifecycle {
    /// Create a lifecycle in `Preparing`. Nothing runs until `start`.
    #[must_use]
    pub fn new(
        udid: DeviceId,
        endpoint: Arc<dyn DeviceEndpoint>,
        ports: Arc<ProxyPortAllocator>,
        serializer: StartupSerializer,
        observer: Arc<dyn StatusObserver>,
    ) -> Arc<Self> {
        let snapshot = DeviceSnapshot {
            udid: udid.clone(),
            state: DeviceState::Preparing,
            public_port: 0,
            colding: false,
            identity: DeviceIdentity::default(),
            properties: None,
            updated_at: Utc::now(),
        };

        Arc::new(Self {
            udid,
            endpoint,
            ports,
            serializer,
            observer,
            snapshot: RwLock::new(snapshot),
            lease: Mutex::new(None),
            ops: tokio::sync::Mutex::new(()),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    /// Device serial.
    #[must_use]
    pub const fn udid(&self) -> &DeviceId {
        &self.udid
    }

    /// Current view of the device.
    #[must_use]
    pub fn snapshot(&self) -> DeviceSnapshot {
        self.snapshot.read().clone()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> DeviceState {
        self.snapshot.read().state
    }

    /// Published proxy port, or `0` unless `Ready`.
    #[must_use]
    pub fn public_port(&self) -> u16 {
        self.snapshot.read().public_port
    }

    /// Returns true while a cold reset is in progress.
    #[must_use]
    pub fn is_colding(&self) -> bool {
        self.snapshot.read().colding
    }

    /// Returns true once `stop` has been requested.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Spawn the prepare task. Calling it again has no effect.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() || self.cancel.is_cancelled() {
            debug!(udid = %self.udid, "Lifecycle already started");
            return;
        }
        *task = Some(tokio::spawn(Arc::clone(self).run_prepare()));
    }

    /// Cancel in-flight work, stop the endpoint and release the port.
    ///
    /// No status is reported after `stop` returns.
    pub async fn stop(&self) {
        self.cancel.cancel();

        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(udid = %self.udid, error = %e, "Prepare task ended abnormally");
            }
        }

        let _ops = self.ops.lock().await;
        self.endpoint.stop().await;
        self.lease.lock().take();
        {
            let mut snapshot = self.snapshot.write();
            snapshot.public_port = 0;
            snapshot.colding = false;
        }
        info!(udid = %self.udid, "Device released");
    }

    /// Restart the endpoint on a fresh port.
    ///
    /// Allowed from `Ready` or `Fatal`. While it runs the device is
    /// `Preparing` with `colding` set and no status is reported; the caller
    /// publishes the outcome. Returns the new port and healthcheck info.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` when the device is still preparing,
    /// `Cancelled` when the device is unplugged meanwhile, or the endpoint
    /// failure that left the device `Fatal`.
    pub async fn cold_restart(&self) -> Result<(u16, DeviceInfo)> {
        let _ops = self.ops.lock().await;
        if self.cancel.is_cancelled() {
            return Err(AgentError::Cancelled(self.udid.clone()));
        }

        let from = self.state();
        validate_transition(&self.udid, from, DeviceState::Preparing)?;
        info!(udid = %self.udid, from = %from, "Cold reset started");
        {
            let mut snapshot = self.snapshot.write();
            snapshot.colding = true;
            snapshot.state = DeviceState::Preparing;
            snapshot.public_port = 0;
            snapshot.updated_at = Utc::now();
        }

        self.endpoint.stop().await;
        self.lease.lock().take();

        let outcome = tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(AgentError::Cancelled(self.udid.clone())),
            result = self.bring_up() => result,
        };

        match outcome {
            Ok((lease, info)) => {
                let port = lease.port();
                *self.lease.lock() = Some(lease);
                self.commit(DeviceState::Ready, port, Some(info.clone()));
                self.snapshot.write().colding = false;
                info!(udid = %self.udid, port, "Cold reset completed");
                Ok((port, info))
            }
            Err(AgentError::Cancelled(udid)) => Err(AgentError::Cancelled(udid)),
            Err(e) => {
                self.commit(DeviceState::Fatal, 0, None);
                self.snapshot.write().colding = false;
                warn!(udid = %self.udid, error = %e, "Cold reset failed");
                Err(e)
            }
        }
    }

    async fn run_prepare(self: Arc<Self>) {
        let _ops = self.ops.lock().await;

        let identity = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return,
            identity = self.endpoint.identity() => identity,
        };
        self.snapshot.write().identity = identity.clone();
        info!(udid = %self.udid, name = %identity.name, "Preparing device");
        self.emit(StatusEvent::Preparing { identity }).await;

        let outcome = tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(AgentError::Cancelled(self.udid.clone())),
            result = self.prepare() => result,
        };
        if self.cancel.is_cancelled() {
            debug!(udid = %self.udid, "Prepare abandoned");
            return;
        }

        match outcome {
            Ok((lease, info)) => {
                let port = lease.port();
                *self.lease.lock() = Some(lease);
                self.commit(DeviceState::Ready, port, Some(info.clone()));
                info!(udid = %self.udid, port, "Device ready");
                let identity = self.snapshot.read().identity.clone();
                self.emit(StatusEvent::Ready {
                    identity,
                    public_port: port,
                    info,
                })
                .await;
            }
            Err(e) => {
                self.commit(DeviceState::Fatal, 0, None);
                warn!(udid = %self.udid, error = %e, "Device failed to prepare");
                self.emit(StatusEvent::Fatal {
                    reason: e.to_string(),
                })
                .await;
            }
        }
    }

    async fn prepare(&self) -> Result<(PortLease, DeviceInfo)> {
        let _permit = self.serializer.acquire(&self.udid).await;
        self.bring_up().await
    }

    async fn bring_up(&self) -> Result<(PortLease, DeviceInfo)> {
        let lease = self.ports.acquire()?;

        if let Err(e) = self.endpoint.start(lease.port()).await {
            self.endpoint.stop().await;
            return Err(e);
        }
        match self.endpoint.healthcheck().await {
            Ok(info) => Ok((lease, info)),
            Err(e) => {
                self.endpoint.stop().await;
                Err(e)
            }
        }
    }

    fn commit(&self, to: DeviceState, public_port: u16, properties: Option<DeviceInfo>) {
        let mut snapshot = self.snapshot.write();
        if let Err(e) = validate_transition(&self.udid, snapshot.state, to) {
            error!(udid = %self.udid, error = %e, "Rejected lifecycle transition");
            return;
        }

        snapshot.state = to;
        snapshot.public_port = if to == DeviceState::Ready { public_port } else { 0 };
        if properties.is_some() {
            snapshot.properties = properties;
        }
        snapshot.updated_at = Utc::now();
    }

    async fn emit(&self, event: StatusEvent) {
        if self.is_colding() {
            debug!(udid = %self.udid, state = %event.state(), "Status suppressed while colding");
            return;
        }
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                debug!(udid = %self.udid, state = %event.state(), "Status dropped after stop");
            }
            () = self.observer.on_status(&self.udid, &event) => {}
        }
    }
}

impl Drop for DeviceLifecycle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
