//! Devfleet provider - iOS device host agent
//!
//! Tracks attached devices, brings up a WebDriverAgent proxy per device,
//! registers them with the central registry and serves the control API.
//!
//! # Configuration
//!
//! Read from the environment: `LISTEN_ADDR`, `REGISTRY_ADDR`, `PUBLIC_HOST`,
//! `PROVIDER_NAME`, `PROVIDER_OWNER`, `PROVIDER_SECRET`, `WDA_LAUNCH_CMD`,
//! `WDA_BUNDLE_PATTERN`, `PROXY_CMD`, `PORT_RANGE_START`, `PORT_RANGE_END`.

use std::str::FromStr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use devfleet_agent::{
    net, AgentConfig, ColdResetCoordinator, CommandTracker, FleetWatcher, HeartbeatObserver,
    ProxyPortAllocator, WdaEndpointFactory,
};
use devfleet_gateway::{create_router, GatewayConfig, GatewayState};
use devfleet_registry::{HeartbeatClient, HeartbeatConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,devfleet=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting devfleet provider");

    // Load configuration from environment
    let gateway_config = GatewayConfig {
        listen_addr: std::env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:3600".into()),
        ..GatewayConfig::default()
    };
    let registry_addr = std::env::var("REGISTRY_ADDR").unwrap_or_else(|_| "localhost:4000".into());
    let public_host = net::public_host(std::env::var("PUBLIC_HOST").ok().as_deref());

    let mut agent_config = AgentConfig::default();
    if let Ok(command) = std::env::var("PROXY_CMD") {
        agent_config.proxy_command = command;
    }
    agent_config.wda_launch_command = std::env::var("WDA_LAUNCH_CMD").ok();
    if let Ok(pattern) = std::env::var("WDA_BUNDLE_PATTERN") {
        agent_config.wda_bundle_pattern = pattern;
    }
    agent_config.port_range_start = env_parse("PORT_RANGE_START", agent_config.port_range_start);
    agent_config.port_range_end = env_parse("PORT_RANGE_END", agent_config.port_range_end);
    let agent_config = Arc::new(agent_config);

    let listen_port = gateway_config.listen_port().unwrap_or(3600);
    let mut heartbeat_config =
        HeartbeatConfig::new(&registry_addr, "apple", format!("http://{public_host}:{listen_port}"));
    if let Ok(name) = std::env::var("PROVIDER_NAME") {
        heartbeat_config.name = name;
    }
    heartbeat_config.owner = std::env::var("PROVIDER_OWNER").ok();
    heartbeat_config.secret = std::env::var("PROVIDER_SECRET").ok();

    tracing::info!(
        listen_addr = %gateway_config.listen_addr,
        registry = %heartbeat_config.registry_addr,
        public_host = %public_host,
        ports = ?agent_config.port_range(),
        launcher = ?agent_config.wda_launch_command,
        "Provider configuration loaded"
    );

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.cancel();
        });
    }

    // Register with the central registry, waiting out an outage
    let Some(heartbeat) =
        HeartbeatClient::connect_ws_until_cancelled(heartbeat_config, &shutdown).await?
    else {
        tracing::info!("Shutdown requested before the registry answered");
        return Ok(());
    };
    let heartbeat = Arc::new(heartbeat);

    // Device fleet
    let fleet = Arc::new(FleetWatcher::new(
        ProxyPortAllocator::new(agent_config.port_range(), agent_config.port_probe_attempts),
        Arc::new(WdaEndpointFactory::new(Arc::clone(&agent_config))),
        Arc::new(HeartbeatObserver::new(
            Arc::clone(&heartbeat),
            public_host.clone(),
            agent_config.brand.clone(),
        )),
    ));
    let coordinator = Arc::new(ColdResetCoordinator::new(
        Arc::clone(&fleet),
        Arc::clone(&heartbeat),
        public_host,
        agent_config.brand.clone(),
    ));

    let tracker = CommandTracker::new(&agent_config.tracker_command, agent_config.tracker_interval())
        .ok_or("device listing command is empty")?;
    let watcher = {
        let fleet = Arc::clone(&fleet);
        tokio::spawn(async move { fleet.run(tracker.into_stream()).await })
    };
    tracing::info!(command = %agent_config.tracker_command, "Device tracking started");

    // Start HTTP server
    let app = create_router(GatewayState::new(
        Arc::clone(&fleet),
        coordinator,
        gateway_config.clone(),
    ));
    tracing::info!(listen_addr = %gateway_config.listen_addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(&gateway_config.listen_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    // Release devices before leaving the registry
    watcher.abort();
    fleet.shutdown().await;
    heartbeat.shutdown().await;
    tracing::info!("Provider stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}

fn env_parse<T: FromStr + Copy + std::fmt::Display>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, default = %default, "Ignoring unparsable setting");
            default
        }),
        Err(_) => default,
    }
}
