//! HTTP control surface for the devfleet provider.
//!
//! Operators and the central registry use it to inspect attached devices
//! and to trigger cold resets.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use devfleet_agent::{
//!     AgentConfig, ColdResetCoordinator, FleetWatcher, HeartbeatObserver, ProxyPortAllocator,
//!     WdaEndpointFactory,
//! };
//! use devfleet_gateway::{create_router, GatewayConfig, GatewayState};
//! use devfleet_registry::{HeartbeatClient, HeartbeatConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let agent = Arc::new(AgentConfig::default());
//! let heartbeat = Arc::new(
//!     HeartbeatClient::connect_ws(HeartbeatConfig::new("localhost:4000", "apple", "http://10.0.0.2:3600"))
//!         .await?,
//! );
//! let fleet = Arc::new(FleetWatcher::new(
//!     ProxyPortAllocator::new(agent.port_range(), agent.port_probe_attempts),
//!     Arc::new(WdaEndpointFactory::new(Arc::clone(&agent))),
//!     Arc::new(HeartbeatObserver::new(Arc::clone(&heartbeat), "10.0.0.2", "Apple")),
//! ));
//! let coordinator = Arc::new(ColdResetCoordinator::new(
//!     Arc::clone(&fleet),
//!     heartbeat,
//!     "10.0.0.2",
//!     "Apple",
//! ));
//!
//! let app = create_router(GatewayState::new(fleet, coordinator, GatewayConfig::default()));
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:3600").await?;
//! axum::serve(listener, app).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

pub use config::GatewayConfig;
pub use error::ApiError;
pub use routes::create_router;
pub use state::GatewayState;
