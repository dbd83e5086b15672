use axum::{extract::State, response::IntoResponse, Json};
use std::sync::Arc;

use ax_telemetry::metrics::global_metrics;

use super::state::ApiState;

/// GET /health — liveness probe.
pub(crate) async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// GET /api/status — build/uptime/queue snapshot.
pub(crate) async fn status(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    let queue = state.queue.stats().await.ok();
    Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSeconds": state.uptime_seconds(),
        "sharedCache": state.cache.has_shared_cache(),
        "queue": queue,
        "cronJobs": state.scheduler.job_count(),
        "metrics": global_metrics().snapshot_json(),
    }))
}

/// GET /config/defaults — env-derived defaults for dashboard bootstrap.
pub(crate) async fn config_defaults(
    State(state): State<Arc<ApiState>>,
) -> impl IntoResponse {
    Json(serde_json::json!({
        "defaultImage": state.config.defaults.image,
        "baseUrls": state.config.defaults.base_urls,
        "environments": ["dev", "staging", "prod"],
    }))
}
