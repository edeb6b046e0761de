//! Heartbeat client configuration.

use std::time::Duration;

use crate::backoff::ReconnectBackoff;

/// Configuration for the registry heartbeat.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Registry `host:port`.
    pub registry_addr: String,
    /// Platform tag attached to every update ("apple", "android").
    pub platform: String,
    /// URL at which the registry can reach this provider.
    pub self_url: String,
    /// Provider name announced in the handshake.
    pub name: String,
    /// Optional owner announced in the handshake.
    pub owner: Option<String>,
    /// Optional shared secret announced in the handshake.
    pub secret: Option<String>,
    /// Provider priority announced in the handshake.
    pub priority: u32,
    /// Handshake attempts before `connect` gives up.
    pub connect_attempts: u32,
    /// Delay policy between dials.
    pub backoff: ReconnectBackoff,
    /// Keepalive interval.
    pub ping_interval: Duration,
}

impl HeartbeatConfig {
    /// Create a configuration with default handshake and retry settings.
    ///
    /// A leading `http://`, `https://` or `ws://` and any `/` are stripped from
    /// `registry_addr`, so both `localhost:4000` and `http://localhost:4000/`
    /// are accepted.
    #[must_use]
    pub fn new(
        registry_addr: impl AsRef<str>,
        platform: impl Into<String>,
        self_url: impl Into<String>,
    ) -> Self {
        Self {
            registry_addr: normalize_addr(registry_addr.as_ref()),
            platform: platform.into(),
            self_url: self_url.into(),
            name: "devfleet-provider".to_string(),
            owner: None,
            secret: None,
            priority: 2,
            connect_attempts: 5,
            backoff: ReconnectBackoff::default(),
            ping_interval: Duration::from_secs(10),
        }
    }
}

fn normalize_addr(addr: &str) -> String {
    let trimmed = ["http://", "https://", "ws://", "wss://"]
        .iter()
        .find_map(|scheme| addr.strip_prefix(scheme))
        .unwrap_or(addr);
    trimmed.replace('/', "")
}
