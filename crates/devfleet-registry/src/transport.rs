//! Transport seam between the heartbeat client and the registry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use devfleet_core::DeviceUpdate;
use serde::Serialize;

use crate::error::Result;

/// Handshake announcement sent when a session is opened.
#[derive(Debug, Clone, Serialize)]
pub struct Handshake {
    /// Provider name.
    pub name: String,
    /// Provider owner.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Shared secret.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    /// Base URL of this provider's control surface.
    pub url: String,
    /// Provider priority.
    pub priority: u32,
}

/// A registration session assigned by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Session token from the handshake reply.
    pub id: String,
    /// When the handshake completed.
    pub connected_at: DateTime<Utc>,
}

impl Session {
    /// Create a session stamped with the current time.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            connected_at: Utc::now(),
        }
    }
}

/// Opens sessions with the registry.
///
/// This trait abstracts the registry transport, allowing for
/// in-memory implementations in tests.
#[async_trait]
pub trait RegistryConnector: Send + Sync {
    /// Dial the registry and perform the handshake.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be reached or refuses the
    /// handshake.
    async fn connect(&self, handshake: &Handshake) -> Result<Box<dyn RegistryLink>>;
}

/// One open session with the registry.
#[async_trait]
pub trait RegistryLink: Send {
    /// The session this link belongs to.
    fn session(&self) -> &Session;

    /// Push one device record.
    ///
    /// # Errors
    ///
    /// Returns an error if the link is broken. The caller must reconnect.
    async fn send_update(&mut self, platform: &str, update: &DeviceUpdate) -> Result<()>;

    /// Send a keepalive and surface a broken link.
    ///
    /// # Errors
    ///
    /// Returns an error if the link is broken.
    async fn ping(&mut self) -> Result<()>;
}
