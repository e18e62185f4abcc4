use axum::{extract::State, response::IntoResponse, Json};
use serde::Serialize;

use crate::metrics;
use crate::relay::Relay;

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub online: usize,
    pub queued: usize,
}

pub async fn health_check(State(relay): State<Relay>) -> Json<HealthStatus> {
    let stats = relay.stats();
    Json(HealthStatus {
        status: "ok",
        online: stats.online,
        queued: stats.queued,
    })
}

pub async fn metrics_handler() -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain")],
        metrics::gather(),
    )
}
