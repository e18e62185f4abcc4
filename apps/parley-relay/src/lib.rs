//! Parley signaling relay: presence, call-link tracking and store-and-forward
//! delivery of call-setup and chat envelopes over WebSockets.

pub mod cli;
pub mod config;
pub mod handlers;
pub mod links;
pub mod metrics;
pub mod queue;
pub mod registry;
pub mod relay;
pub mod telemetry;
pub mod websocket;

use axum::{routing::get, Router};
use std::future::Future;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use relay::{Relay, RelayStats, RouteOutcome};

/// Build the HTTP surface: WebSocket upgrade at `/` and `/ws`, plus health
/// and Prometheus endpoints.
pub fn build_app(relay: Relay) -> Router {
    Router::new()
        .route("/", get(websocket::websocket_handler))
        .route("/ws", get(websocket::websocket_handler))
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
        .with_state(relay)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Serve `relay` on `listener` until `shutdown` resolves, then close every
/// registered connection.
pub async fn serve<F>(listener: TcpListener, relay: Relay, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_app(relay.clone());
    let closer = relay.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            closer.shutdown();
        })
        .await
}
