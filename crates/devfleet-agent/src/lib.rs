//! Per-device lifecycle management for the devfleet provider.
//!
//! This crate turns plug/unplug events into running automation endpoints:
//!
//! - [`FleetWatcher`]: one [`DeviceLifecycle`] per attached device
//! - [`DeviceLifecycle`]: Preparing → Ready/Fatal, cancellable on unplug
//! - [`StartupSerializer`]: one endpoint startup at a time, FIFO
//! - [`ProxyPortAllocator`]: unique proxy ports from a fixed range
//! - [`ColdResetCoordinator`]: restart on a fresh port, announced to the registry
//! - [`CommandTracker`]: presence events from a device listing command
//!
//! # Architecture
//!
//! ```text
//!  CommandTracker ──PresenceEvent──▶ FleetWatcher
//!                                         │ plug / unplug
//!                                         ▼
//!                                  DeviceLifecycle ──▶ StartupSerializer
//!                                    │         │       ProxyPortAllocator
//!                       DeviceEndpoint         ▼
//!                       (WDA + proxy)    StatusObserver ──▶ HeartbeatClient
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cold;
pub mod config;
pub mod device;
pub mod endpoint;
pub mod error;
pub mod fleet;
pub mod lifecycle;
pub mod net;
pub mod observer;
pub mod ports;
pub mod serializer;
pub mod tracker;
pub mod wda;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use cold::{ColdResetCoordinator, ColdResetOutcome};
pub use config::AgentConfig;
pub use device::{DeviceLifecycle, DeviceSnapshot};
pub use endpoint::{DeviceEndpoint, EndpointFactory};
pub use error::{AgentError, Result};
pub use fleet::FleetWatcher;
pub use observer::{HeartbeatObserver, StatusEvent, StatusObserver};
pub use ports::{PortLease, ProxyPortAllocator};
pub use serializer::{StartupPermit, StartupSerializer};
pub use tracker::CommandTracker;
pub use wda::{WdaEndpoint, WdaEndpointFactory};

#[cfg(any(test, feature = "test-utils"))]
pub use mock::{EndpointEvent, MockEndpoint, MockEndpointFactory, RecordingObserver};
