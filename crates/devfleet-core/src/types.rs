//! Device model types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, Result};

/// Lifecycle states for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    /// Device is present, its endpoint is being brought up.
    Preparing,
    /// Healthcheck passed, the endpoint is reachable.
    Ready,
    /// Startup or healthcheck failed. Recovery needs a replug or a cold reset.
    Fatal,
}

impl DeviceState {
    /// Lowercase name used in logs and API bodies.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Preparing => "preparing",
            Self::Ready => "ready",
            Self::Fatal => "fatal",
        }
    }
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What is known about a device before its endpoint is up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// User-visible device name ("Alice's iPhone").
    pub name: String,
    /// Hardware product type ("iPhone14,2").
    pub product: String,
}

/// Descriptive attributes returned by a successful healthcheck.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device name reported by the automation endpoint.
    pub name: Option<String>,
    /// OS version ("16.0").
    pub version: Option<String>,
    /// SDK version of the automation build.
    pub sdk_version: Option<String>,
    /// Device IP address on its own network.
    pub ip: Option<String>,
    /// Bundle identifier of the running automation build.
    pub bundle_id: Option<String>,
}

impl DeviceInfo {
    /// Extract device attributes from a WebDriverAgent `/status` body.
    ///
    /// The body is usually wrapped as `{"value": {...}, "sessionId": ...}`;
    /// an unwrapped object is accepted too. Missing fields stay `None`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::MalformedPayload` if the body is not a JSON object.
    pub fn from_status_payload(body: &Value) -> Result<Self> {
        let root = body
            .get("value")
            .filter(|v| v.is_object())
            .unwrap_or(body);
        if !root.is_object() {
            return Err(CoreError::MalformedPayload(
                "status body is not an object".to_string(),
            ));
        }

        let text = |path: &[&str]| -> Option<String> {
            path.iter()
                .try_fold(root, |node, key| node.get(key))
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        Ok(Self {
            name: text(&["device", "name"]).or_else(|| text(&["name"])),
            version: text(&["os", "version"]),
            sdk_version: text(&["os", "sdkVersion"]),
            ip: text(&["ios", "ip"]),
            bundle_id: text(&["build", "productBundleIdentifier"]),
        })
    }
}

/// A plug/unplug notification from the device transport.
///
/// The udid is kept raw: the transport emits placeholder ids that the
/// fleet watcher filters out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEvent {
    /// Device serial as reported by the transport.
    pub udid: String,
    /// True when the device appeared, false when it went away.
    pub present: bool,
}

impl PresenceEvent {
    /// A device appeared.
    #[must_use]
    pub fn plugged(udid: impl Into<String>) -> Self {
        Self {
            udid: udid.into(),
            present: true,
        }
    }

    /// A device went away.
    #[must_use]
    pub fn unplugged(udid: impl Into<String>) -> Self {
        Self {
            udid: udid.into(),
            present: false,
        }
    }
}
