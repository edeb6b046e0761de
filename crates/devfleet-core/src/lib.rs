//! Core types for the devfleet provider agent.
//!
//! This crate provides the foundational types used by every other devfleet crate:
//!
//! - **Identifiers**: [`DeviceId`], a validated device serial (udid)
//! - **Device model**: lifecycle [`DeviceState`], [`DeviceIdentity`] and the
//!   healthcheck-derived [`DeviceInfo`]
//! - **Wire records**: [`DeviceUpdate`], the record pushed to the registry
//! - **Presence events**: [`PresenceEvent`], the plug/unplug feed
//!
//! # Example
//!
//! ```
//! use devfleet_core::{DeviceId, DeviceUpdate, DeviceIdentity};
//!
//! let udid = DeviceId::parse("00008030-001A2D3E0C41802E").unwrap();
//! let update = DeviceUpdate::preparing(udid, &DeviceIdentity::default(), "Apple");
//! assert!(update.provider.is_none());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod ids;
pub mod record;
pub mod types;

pub use error::{CoreError, Result};
pub use ids::{DeviceId, IdError, SENTINEL_PREFIX};
pub use record::{DeviceProperties, DeviceUpdate, ProviderEndpoint};
pub use types::{DeviceIdentity, DeviceInfo, DeviceState, PresenceEvent};
