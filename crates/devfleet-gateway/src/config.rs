//! Gateway configuration types.

use std::time::Duration;

use serde::Deserialize;

/// Configuration for the control HTTP surface.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Listen address (e.g., "0.0.0.0:3600").
    #[serde(default = "GatewayConfig::default_listen_addr")]
    pub listen_addr: String,

    /// Allowed CORS origins.
    #[serde(default = "GatewayConfig::default_cors_origins")]
    pub cors_origins: Vec<String>,

    /// Request timeout in seconds. Must outlast a full cold reset.
    #[serde(default = "GatewayConfig::default_request_timeout")]
    pub request_timeout_seconds: u64,
}

impl GatewayConfig {
    fn default_listen_addr() -> String {
        "0.0.0.0:3600".to_string()
    }

    fn default_cors_origins() -> Vec<String> {
        vec!["*".to_string()]
    }

    const fn default_request_timeout() -> u64 {
        120
    }

    /// Get the request timeout as a `Duration`.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    /// Port part of the listen address, if it parses.
    #[must_use]
    pub fn listen_port(&self) -> Option<u16> {
        self.listen_addr.rsplit_once(':')?.1.parse().ok()
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: Self::default_listen_addr(),
            cors_origins: Self::default_cors_origins(),
            request_timeout_seconds: Self::default_request_timeout(),
        }
    }
}
