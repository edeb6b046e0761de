//! Heartbeat registration with the central device registry.
//!
//! The provider keeps one persistent session with the registry and pushes
//! device state records through it. This crate provides:
//!
//! - [`HeartbeatClient`]: handshake, queued at-least-once state reporting,
//!   reconnection with backoff and re-announcement of tracked devices
//! - [`RegistryConnector`] / [`RegistryLink`]: the transport seam
//! - [`WsConnector`]: the WebSocket transport used in production
//!
//! # Architecture
//!
//! ```text
//!  lifecycles ──report_device_state──▶ latest-known table
//!                                          │
//!                                          ▼ (unbounded queue)
//!                                   ┌──────────────┐
//!                                   │    worker    │── ping every N s
//!                                   └──────┬───────┘
//!                                          │ RegistryLink
//!                                          ▼
//!                                      registry
//! ```
//!
//! # Example
//!
//! ```no_run
//! use devfleet_registry::{HeartbeatClient, HeartbeatConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = HeartbeatConfig::new("http://localhost:4000/", "apple", "http://10.0.0.2:3600");
//! let client = HeartbeatClient::connect_ws(config).await?;
//! println!("session: {:?}", client.session());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backoff;
pub mod client;
pub mod config;
pub mod error;
pub mod transport;
pub mod ws;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use backoff::ReconnectBackoff;
pub use client::HeartbeatClient;
pub use config::HeartbeatConfig;
pub use error::{RegistryError, Result};
pub use transport::{Handshake, RegistryConnector, RegistryLink, Session};
pub use ws::WsConnector;

#[cfg(any(test, feature = "test-utils"))]
pub use mock::MockRegistry;
