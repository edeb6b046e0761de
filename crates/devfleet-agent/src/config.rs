//! Agent configuration.

use std::ops::Range;
use std::time::Duration;

use serde::Deserialize;

/// Configuration for device lifecycles and their endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// First port of the proxy port range (inclusive).
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,

    /// End of the proxy port range (exclusive).
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,

    /// Candidate ports probed before giving up.
    #[serde(default = "default_port_probe_attempts")]
    pub port_probe_attempts: u32,

    /// Time allowed for the proxy to accept connections.
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_seconds: u64,

    /// Total time allowed for the status probe to succeed.
    #[serde(default = "default_healthcheck_timeout")]
    pub healthcheck_timeout_seconds: u64,

    /// Pause between status probes.
    #[serde(default = "default_healthcheck_interval")]
    pub healthcheck_interval_ms: u64,

    /// WebDriverAgent port on the device side.
    #[serde(default = "default_device_wda_port")]
    pub device_wda_port: u16,

    /// Port-forward command. Placeholders: `{udid}`, `{port}`, `{device_port}`.
    #[serde(default = "default_proxy_command")]
    pub proxy_command: String,

    /// Command that launches WDA on the device. `None` when WDA is started
    /// by hand. Placeholders as for the proxy plus `{bundle}`.
    #[serde(default)]
    pub wda_launch_command: Option<String>,

    /// Bundle id pattern substituted for `{bundle}`.
    #[serde(default = "default_wda_bundle_pattern")]
    pub wda_bundle_pattern: String,

    /// Command that lists attached device serials, one per line.
    #[serde(default = "default_tracker_command")]
    pub tracker_command: String,

    /// Pause between device listings.
    #[serde(default = "default_tracker_interval")]
    pub tracker_interval_ms: u64,

    /// Command queried for device name and product type.
    #[serde(default = "default_device_info_command")]
    pub device_info_command: String,

    /// Brand reported in device properties.
    #[serde(default = "default_brand")]
    pub brand: String,
}

fn default_port_range_start() -> u16 {
    20000
}

fn default_port_range_end() -> u16 {
    40000
}

fn default_port_probe_attempts() -> u32 {
    100
}

fn default_startup_timeout() -> u64 {
    30
}

fn default_healthcheck_timeout() -> u64 {
    60
}

fn default_healthcheck_interval() -> u64 {
    1000
}

fn default_device_wda_port() -> u16 {
    8100
}

fn default_proxy_command() -> String {
    "iproxy {port} {device_port} -u {udid}".to_string()
}

fn default_wda_bundle_pattern() -> String {
    "*WebDriverAgent*".to_string()
}

fn default_tracker_command() -> String {
    "idevice_id -l".to_string()
}

fn default_tracker_interval() -> u64 {
    1000
}

fn default_device_info_command() -> String {
    "ideviceinfo".to_string()
}

fn default_brand() -> String {
    "Apple".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            port_probe_attempts: default_port_probe_attempts(),
            startup_timeout_seconds: default_startup_timeout(),
            healthcheck_timeout_seconds: default_healthcheck_timeout(),
            healthcheck_interval_ms: default_healthcheck_interval(),
            device_wda_port: default_device_wda_port(),
            proxy_command: default_proxy_command(),
            wda_launch_command: None,
            wda_bundle_pattern: default_wda_bundle_pattern(),
            tracker_command: default_tracker_command(),
            tracker_interval_ms: default_tracker_interval(),
            device_info_command: default_device_info_command(),
            brand: default_brand(),
        }
    }
}

impl AgentConfig {
    /// Proxy port range.
    #[must_use]
    pub const fn port_range(&self) -> Range<u16> {
        self.port_range_start..self.port_range_end
    }

    /// Startup timeout as a `Duration`.
    #[must_use]
    pub const fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_seconds)
    }

    /// Healthcheck budget as a `Duration`.
    #[must_use]
    pub const fn healthcheck_timeout(&self) -> Duration {
        Duration::from_secs(self.healthcheck_timeout_seconds)
    }

    /// Healthcheck probe interval as a `Duration`.
    #[must_use]
    pub const fn healthcheck_interval(&self) -> Duration {
        Duration::from_millis(self.healthcheck_interval_ms)
    }

    /// Tracker poll interval as a `Duration`.
    #[must_use]
    pub const fn tracker_interval(&self) -> Duration {
        Duration::from_millis(self.tracker_interval_ms)
    }
}
