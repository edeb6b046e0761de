//! Device endpoint abstraction.
//!
//! A [`DeviceEndpoint`] is the per-device automation endpoint: a
//! WebDriverAgent instance on the device reached through a local
//! port-forward proxy. The lifecycle drives it through `start`,
//! `healthcheck` and `stop`; the endpoint itself keeps no lifecycle state.

use std::sync::Arc;

use async_trait::async_trait;
use devfleet_core::{DeviceId, DeviceIdentity, DeviceInfo};

use crate::error::Result;

/// Trait for a device's automation endpoint.
///
/// This trait abstracts the process-backed WDA proxy, allowing for mock
/// implementations in tests.
#[async_trait]
pub trait DeviceEndpoint: Send + Sync {
    /// Look up the device's name and product type.
    ///
    /// Never fails: unknown fields fall back to the udid or empty strings.
    async fn identity(&self) -> DeviceIdentity;

    /// Bring the endpoint up on the local `port`.
    ///
    /// # Errors
    ///
    /// Returns `StartupTimeout` or `StartupFailed` if the endpoint does not
    /// accept connections in time.
    async fn start(&self, port: u16) -> Result<()>;

    /// Tear the endpoint down. Idempotent.
    async fn stop(&self);

    /// Probe the endpoint until it answers with a status payload.
    ///
    /// # Errors
    ///
    /// Returns `HealthcheckFailed` if the probe budget runs out.
    async fn healthcheck(&self) -> Result<DeviceInfo>;
}

/// Creates the endpoint for a newly attached device.
pub trait EndpointFactory: Send + Sync {
    /// Build an endpoint for `udid`. Nothing is started yet.
    fn create(&self, udid: &DeviceId) -> Arc<dyn DeviceEndpoint>;
}

/// Values substituted into command templates.
#[derive(Debug, Clone)]
pub struct TemplateVars<'a> {
    /// Device serial, for `{udid}`.
    pub udid: &'a str,
    /// Local proxy port, for `{port}`.
    pub port: u16,
    /// Device-side WDA port, for `{device_port}`.
    pub device_port: u16,
    /// WDA bundle pattern, for `{bundle}`.
    pub bundle: &'a str,
}

/// Split a command template into program and arguments and fill in the
/// placeholders. Returns `None` for a blank template.
#[must_use]
pub fn render_command(template: &str, vars: &TemplateVars<'_>) -> Option<(String, Vec<String>)> {
    let port = vars.port.to_string();
    let device_port = vars.device_port.to_string();

    let mut words = template.split_whitespace().map(|word| {
        word.replace("{udid}", vars.udid)
            .replace("{port}", &port)
            .replace("{device_port}", &device_port)
            .replace("{bundle}", vars.bundle)
    });

    let program = words.next()?;
    Some((program, words.collect()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> TemplateVars<'static> {
        TemplateVars {
            udid: "ABC123",
            port: 20001,
            device_port: 8100,
            bundle: "*WebDriverAgent*",
        }
    }

    #[test]
    fn render_proxy_template() {
        let (program, args) =
            render_command("iproxy {port} {device_port} -u {udid}", &vars()).unwrap();

        assert_eq!(program, "iproxy");
        assert_eq!(args, vec!["20001", "8100", "-u", "ABC123"]);
    }

    #[test]
    fn render_embedded_placeholder() {
        let (program, args) =
            render_command("tidevice -u {udid} xctest -B {bundle} --port={port}", &vars())
                .unwrap();

        assert_eq!(program, "tidevice");
        assert_eq!(args.last().unwrap(), "--port=20001");
        assert!(args.contains(&"*WebDriverAgent*".to_string()));
    }

    #[test]
    fn blank_template() {
        assert!(render_command("   ", &vars()).is_none());
    }
}
