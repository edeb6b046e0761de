//! Router configuration.

use axum::routing::{get, post};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{devices, health};
use crate::state::GatewayState;

/// Create the gateway router with all routes and middleware.
///
/// # Routes
///
/// - `GET /health` - Liveness and fleet summary
/// - `GET /devices` - List attached devices
/// - `GET /devices/:udid` - One device
/// - `POST /devices/:udid/cold` - Cold reset a device
/// - `POST /cold?udid=` - Cold reset a device (query form)
pub fn create_router(state: GatewayState) -> Router {
    let cors = build_cors_layer(&state.config.cors_origins);
    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(TimeoutLayer::new(state.config.request_timeout()));

    Router::new()
        .route("/health", get(health::health))
        .route("/devices", get(devices::list_devices))
        .route("/devices/:udid", get(devices::get_device))
        .route("/devices/:udid/cold", post(devices::cold_device))
        .route("/cold", post(devices::cold_by_query))
        .layer(middleware)
        .with_state(state)
}

/// Build the CORS layer from configured origins.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
