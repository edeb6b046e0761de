//! In-memory endpoint and observer for tests.
//!
//! [`MockEndpointFactory`] hands out [`MockEndpoint`]s that share one event
//! log, so tests can check how startups from different devices interleave.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use devfleet_core::{DeviceId, DeviceIdentity, DeviceInfo, DeviceState};
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::endpoint::{DeviceEndpoint, EndpointFactory};
use crate::error::{AgentError, Result};
use crate::observer::{StatusEvent, StatusObserver};

/// Something a mock endpoint did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointEvent {
    /// `start` began on `port`.
    Started {
        /// Device serial.
        udid: DeviceId,
        /// Port passed to `start`.
        port: u16,
    },
    /// `healthcheck` finished, successfully or not.
    Checked {
        /// Device serial.
        udid: DeviceId,
        /// Whether the healthcheck passed.
        healthy: bool,
    },
    /// `stop` was called while running.
    Stopped {
        /// Device serial.
        udid: DeviceId,
    },
}

#[derive(Debug, Default)]
struct EndpointState {
    running_port: Option<u16>,
    fail_healthcheck: bool,
    hang_healthcheck: bool,
    starts: u32,
}

/// Endpoint that pretends to start instantly and answers a canned status.
#[derive(Debug)]
pub struct MockEndpoint {
    udid: DeviceId,
    status: Value,
    delay: Duration,
    state: Mutex<EndpointState>,
    log: Arc<Mutex<Vec<EndpointEvent>>>,
}

impl MockEndpoint {
    /// Make later healthchecks fail (or pass again).
    pub fn set_fail_healthcheck(&self, fail: bool) {
        self.state.lock().fail_healthcheck = fail;
    }

    /// Make later healthchecks never complete.
    pub fn set_hang_healthcheck(&self, hang: bool) {
        self.state.lock().hang_healthcheck = hang;
    }

    /// Returns true between a successful `start` and `stop`.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state.lock().running_port.is_some()
    }

    /// Port of the running endpoint.
    #[must_use]
    pub fn running_port(&self) -> Option<u16> {
        self.state.lock().running_port
    }

    /// Number of `start` calls.
    #[must_use]
    pub fn start_count(&self) -> u32 {
        self.state.lock().starts
    }
}

#[async_trait]
impl DeviceEndpoint for MockEndpoint {
    async fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            name: format!("iPhone {}", self.udid.short()),
            product: "iPhone14,2".to_string(),
        }
    }

    async fn start(&self, port: u16) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.starts += 1;
            state.running_port = Some(port);
        }
        self.log.lock().push(EndpointEvent::Started {
            udid: self.udid.clone(),
            port,
        });
        tokio::time::sleep(self.delay).await;
        Ok(())
    }

    async fn stop(&self) {
        if self.state.lock().running_port.take().is_some() {
            self.log.lock().push(EndpointEvent::Stopped {
                udid: self.udid.clone(),
            });
        }
    }

    async fn healthcheck(&self) -> Result<DeviceInfo> {
        let (fail, hang) = {
            let state = self.state.lock();
            (state.fail_healthcheck, state.hang_healthcheck)
        };
        if hang {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(self.delay).await;

        self.log.lock().push(EndpointEvent::Checked {
            udid: self.udid.clone(),
            healthy: !fail,
        });
        if fail {
            return Err(AgentError::HealthcheckFailed {
                udid: self.udid.clone(),
                reason: "mock healthcheck failure".to_string(),
            });
        }
        DeviceInfo::from_status_payload(&self.status).map_err(|e| AgentError::HealthcheckFailed {
            udid: self.udid.clone(),
            reason: e.to_string(),
        })
    }
}

/// Creates [`MockEndpoint`]s and keeps them for inspection.
#[derive(Debug, Default)]
pub struct MockEndpointFactory {
    delay: Duration,
    endpoints: Mutex<HashMap<DeviceId, Arc<MockEndpoint>>>,
    failing: Mutex<HashSet<DeviceId>>,
    hanging: Mutex<HashSet<DeviceId>>,
    log: Arc<Mutex<Vec<EndpointEvent>>>,
}

impl MockEndpointFactory {
    /// Factory whose endpoints answer immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory whose endpoints take `delay` to start and to healthcheck.
    #[must_use]
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Endpoints created for `udid` fail their healthcheck.
    pub fn fail_healthcheck_for(&self, udid: &DeviceId) {
        self.failing.lock().insert(udid.clone());
    }

    /// Endpoints created for `udid` never finish their healthcheck.
    pub fn hang_healthcheck_for(&self, udid: &DeviceId) {
        self.hanging.lock().insert(udid.clone());
    }

    /// The most recent endpoint created for `udid`.
    #[must_use]
    pub fn endpoint(&self, udid: &DeviceId) -> Option<Arc<MockEndpoint>> {
        self.endpoints.lock().get(udid).cloned()
    }

    /// Everything the endpoints did, in order.
    #[must_use]
    pub fn events(&self) -> Vec<EndpointEvent> {
        self.log.lock().clone()
    }
}

impl EndpointFactory for MockEndpointFactory {
    fn create(&self, udid: &DeviceId) -> Arc<dyn DeviceEndpoint> {
        let endpoint = Arc::new(MockEndpoint {
            udid: udid.clone(),
            status: json!({"os": {"version": "16.0", "sdkVersion": "20"}}),
            delay: self.delay,
            state: Mutex::new(EndpointState {
                fail_healthcheck: self.failing.lock().contains(udid),
                hang_healthcheck: self.hanging.lock().contains(udid),
                ..EndpointState::default()
            }),
            log: Arc::clone(&self.log),
        });
        self.endpoints
            .lock()
            .insert(udid.clone(), Arc::clone(&endpoint));
        endpoint
    }
}

/// Observer that records every callback.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<(DeviceId, StatusEvent)>>,
    removed: Mutex<Vec<DeviceId>>,
}

impl RecordingObserver {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All status callbacks, in order.
    #[must_use]
    pub fn events(&self) -> Vec<(DeviceId, StatusEvent)> {
        self.events.lock().clone()
    }

    /// Status callbacks for one device.
    #[must_use]
    pub fn events_for(&self, udid: &DeviceId) -> Vec<StatusEvent> {
        self.events
            .lock()
            .iter()
            .filter(|(id, _)| id == udid)
            .map(|(_, event)| event.clone())
            .collect()
    }

    /// States reported for one device, in order.
    #[must_use]
    pub fn states_for(&self, udid: &DeviceId) -> Vec<DeviceState> {
        self.events_for(udid).iter().map(StatusEvent::state).collect()
    }

    /// Devices reported as removed, in order.
    #[must_use]
    pub fn removed(&self) -> Vec<DeviceId> {
        self.removed.lock().clone()
    }
}

#[async_trait]
impl StatusObserver for RecordingObserver {
    async fn on_status(&self, udid: &DeviceId, event: &StatusEvent) {
        self.events.lock().push((udid.clone(), event.clone()));
    }

    async fn on_removed(&self, udid: &DeviceId) {
        self.removed.lock().push(udid.clone());
    }
}
