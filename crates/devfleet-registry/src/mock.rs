//! In-memory registry for tests.
//!
//! [`MockRegistry`] records every handshake and update, and can be told to
//! refuse connections or to drop the open session so reconnection paths can
//! be exercised without a network.

use std::sync::Arc;

use async_trait::async_trait;
use devfleet_core::{DeviceId, DeviceUpdate};
use parking_lot::Mutex;

use crate::error::{RegistryError, Result};
use crate::transport::{Handshake, RegistryConnector, RegistryLink, Session};

#[derive(Default)]
struct MockState {
    connect_attempts: u32,
    refuse_connects: u32,
    reject_reason: Option<String>,
    sessions: u32,
    epoch: u32,
    handshakes: Vec<Handshake>,
    updates: Vec<RecordedUpdate>,
    pings: u32,
}

struct RecordedUpdate {
    session: u32,
    platform: String,
    update: DeviceUpdate,
}

/// A registry stand-in that stores traffic in memory.
///
/// Clones share state, so a test can keep one handle while the heartbeat
/// client owns another.
#[derive(Clone, Default)]
pub struct MockRegistry {
    state: Arc<Mutex<MockState>>,
}

impl MockRegistry {
    /// Create an empty registry that accepts every connection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` connection attempts with a transport error.
    pub fn refuse_next_connects(&self, n: u32) {
        self.state.lock().refuse_connects = n;
    }

    /// Answer every future handshake with a refusal.
    pub fn reject_handshakes(&self, reason: &str) {
        self.state.lock().reject_reason = Some(reason.to_string());
    }

    /// Break every open session. Their next send or ping fails.
    pub fn drop_connection(&self) {
        self.state.lock().epoch += 1;
    }

    /// Number of connection attempts, successful or not.
    #[must_use]
    pub fn connect_attempts(&self) -> u32 {
        self.state.lock().connect_attempts
    }

    /// Number of sessions opened so far.
    #[must_use]
    pub fn session_count(&self) -> u32 {
        self.state.lock().sessions
    }

    /// Number of keepalives received.
    #[must_use]
    pub fn ping_count(&self) -> u32 {
        self.state.lock().pings
    }

    /// Handshakes received, in order.
    #[must_use]
    pub fn handshakes(&self) -> Vec<Handshake> {
        self.state.lock().handshakes.clone()
    }

    /// Every update received, in order.
    #[must_use]
    pub fn updates(&self) -> Vec<DeviceUpdate> {
        self.state
            .lock()
            .updates
            .iter()
            .map(|r| r.update.clone())
            .collect()
    }

    /// Updates received on the `session`-th session (1-indexed).
    #[must_use]
    pub fn updates_in_session(&self, session: u32) -> Vec<DeviceUpdate> {
        self.state
            .lock()
            .updates
            .iter()
            .filter(|r| r.session == session)
            .map(|r| r.update.clone())
            .collect()
    }

    /// Updates received for one device, in order.
    #[must_use]
    pub fn updates_for(&self, udid: &DeviceId) -> Vec<DeviceUpdate> {
        self.state
            .lock()
            .updates
            .iter()
            .filter(|r| &r.update.udid == udid)
            .map(|r| r.update.clone())
            .collect()
    }

    /// Platform tag of every update received, in order.
    #[must_use]
    pub fn platforms(&self) -> Vec<String> {
        self.state
            .lock()
            .updates
            .iter()
            .map(|r| r.platform.clone())
            .collect()
    }
}

#[async_trait]
impl RegistryConnector for MockRegistry {
    async fn connect(&self, handshake: &Handshake) -> Result<Box<dyn RegistryLink>> {
        let mut state = self.state.lock();
        state.connect_attempts += 1;

        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            return Err(RegistryError::Transport("connection refused".to_string()));
        }
        if let Some(reason) = &state.reject_reason {
            return Err(RegistryError::HandshakeRejected(reason.clone()));
        }

        state.sessions += 1;
        state.handshakes.push(handshake.clone());
        Ok(Box::new(MockLink {
            state: Arc::clone(&self.state),
            number: state.sessions,
            epoch: state.epoch,
            session: Session::new(format!("mock-session-{}", state.sessions)),
        }))
    }
}

struct MockLink {
    state: Arc<Mutex<MockState>>,
    number: u32,
    epoch: u32,
    session: Session,
}

impl MockLink {
    fn check_alive(&self, state: &MockState) -> Result<()> {
        if state.epoch == self.epoch {
            Ok(())
        } else {
            Err(RegistryError::Transport("connection reset".to_string()))
        }
    }
}

#[async_trait]
impl RegistryLink for MockLink {
    fn session(&self) -> &Session {
        &self.session
    }

    async fn send_update(&mut self, platform: &str, update: &DeviceUpdate) -> Result<()> {
        let mut state = self.state.lock();
        self.check_alive(&state)?;
        state.updates.push(RecordedUpdate {
            session: self.number,
            platform: platform.to_string(),
            update: update.clone(),
        });
        Ok(())
    }

    async fn ping(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        self.check_alive(&state)?;
        state.pings += 1;
        Ok(())
    }
}
