//! Registry wire records.
//!
//! A [`DeviceUpdate`] is the unit of state the provider pushes to the
//! central registry. `provider` is always serialized: `null` tells the
//! registry no endpoint is available for the device.

use serde::{Deserialize, Serialize};

use crate::ids::DeviceId;
use crate::types::{DeviceIdentity, DeviceInfo};

/// Network address of a Ready device's automation endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEndpoint {
    /// Base URL of the WebDriverAgent proxy.
    #[serde(rename = "wdaUrl")]
    pub wda_url: String,
}

impl ProviderEndpoint {
    /// Build the endpoint for a proxy listening on `host:port`.
    #[must_use]
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            wda_url: format!("http://{host}:{port}"),
        }
    }
}

/// Descriptive device attributes reported to the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceProperties {
    /// Device name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Hardware product type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    /// Vendor brand.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
    /// Device IP address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// OS version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Automation SDK version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdk_version: Option<String>,
}

impl DeviceProperties {
    /// Attributes of a Ready device: who it is plus what its healthcheck
    /// reported.
    #[must_use]
    pub fn from_parts(identity: &DeviceIdentity, brand: &str, info: &DeviceInfo) -> Self {
        Self {
            name: Some(identity.name.clone()),
            product: Some(identity.product.clone()),
            brand: Some(brand.to_string()),
            ip: info.ip.clone(),
            version: info.version.clone(),
            sdk_version: info.sdk_version.clone(),
        }
    }
}

/// One device state record for the registry's `update` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceUpdate {
    /// Device serial.
    pub udid: DeviceId,
    /// Reset in progress. Omitted when unchanged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub colding: Option<bool>,
    /// Endpoint address, or `None` (serialized as `null`) when absent.
    pub provider: Option<ProviderEndpoint>,
    /// Descriptive attributes. Omitted when unchanged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<DeviceProperties>,
}

impl DeviceUpdate {
    /// Record announcing a present device whose endpoint is not up yet.
    #[must_use]
    pub fn preparing(udid: DeviceId, identity: &DeviceIdentity, brand: &str) -> Self {
        Self {
            udid,
            colding: Some(false),
            provider: None,
            properties: Some(DeviceProperties {
                name: Some(identity.name.clone()),
                product: Some(identity.product.clone()),
                brand: Some(brand.to_string()),
                ..DeviceProperties::default()
            }),
        }
    }

    /// Record announcing a Ready device.
    ///
    /// `properties` should be the full set (see
    /// [`DeviceProperties::from_parts`]): it replaces whatever the registry
    /// and the latest-known table held before.
    #[must_use]
    pub fn ready(udid: DeviceId, endpoint: ProviderEndpoint, properties: DeviceProperties) -> Self {
        Self {
            udid,
            colding: None,
            provider: Some(endpoint),
            properties: Some(properties),
        }
    }

    /// Record withdrawing a device's endpoint.
    #[must_use]
    pub fn offline(udid: DeviceId) -> Self {
        Self {
            udid,
            colding: None,
            provider: None,
            properties: None,
        }
    }

    /// Set the colding flag.
    #[must_use]
    pub fn with_colding(mut self, colding: bool) -> Self {
        self.colding = Some(colding);
        self
    }

    /// Fold a newer record for the same device into this one.
    ///
    /// `provider` is always taken from the newer record; `colding` and
    /// `properties` only when the newer record carries them. Properties are
    /// replaced wholesale, never merged field by field.
    pub fn merge(&mut self, newer: Self) {
        debug_assert_eq!(self.udid, newer.udid);
        self.provider = newer.provider;
        if newer.colding.is_some() {
            self.colding = newer.colding;
        }
        if newer.properties.is_some() {
            self.properties = newer.properties;
        }
    }
}
