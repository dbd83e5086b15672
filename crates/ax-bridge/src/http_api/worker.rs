//! Worker callback sink.
//!
//! Workers authenticate with the shared secret (checked by the identity
//! gate) and report status transitions and log lines. Broadcasts are
//! strictly per-org: a callback without `orgId` is a worker bug — it is
//! logged and dropped, never broadcast globally.

use axum::{extract::State, response::IntoResponse, Json};
use std::sync::Arc;
use tracing::warn;

use ax_store::ExecutionPatch;

use crate::api_error::ApiError;
use crate::protocol::RoomMessage;

use super::state::ApiState;
use super::types::{WorkerLogRequest, WorkerUpdateRequest};
use super::WorkerAuth;

/// POST /executions/update — status transition from a worker.
pub(crate) async fn update_execution(
    State(state): State<Arc<ApiState>>,
    _auth: WorkerAuth,
    Json(req): Json<WorkerUpdateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let Some(org_id) = req.org_id.as_deref() else {
        warn!(task_id = %req.task_id, "worker update without orgId, dropping");
        return Err(ApiError::BadRequest("orgId is required".into()));
    };

    let execution = state
        .store
        .patch_execution(
            org_id,
            &req.task_id,
            ExecutionPatch {
                status: Some(req.status),
                end_time: req.end_time,
                output: req.output.clone(),
                tests: None,
            },
        )
        .await
        .map_err(|_| ApiError::NotFound("Execution not found".into()))?;

    // Completed runs feed the per-image perf rollup.
    if let Some(end_time) = execution.end_time {
        let duration_ms = (end_time - execution.start_time).num_milliseconds().max(0);
        let image = execution.image.clone();
        let previous = state.cache.get_image_metric(org_id, &image).await;
        let (samples, avg) = match previous {
            Some(metric) => {
                let samples = metric["samples"].as_u64().unwrap_or(0);
                let avg = metric["avgDurationMs"].as_f64().unwrap_or(0.0);
                let samples_next = samples + 1;
                (
                    samples_next,
                    (avg * samples as f64 + duration_ms as f64) / samples_next as f64,
                )
            }
            None => (1, duration_ms as f64),
        };
        state
            .cache
            .put_image_metric(
                org_id,
                &image,
                serde_json::json!({
                    "avgDurationMs": avg.round(),
                    "lastDurationMs": duration_ms,
                    "samples": samples,
                }),
            )
            .await;
    }

    state
        .rooms
        .publish_to_org(org_id, RoomMessage::ExecutionUpdated(execution));

    Ok(Json(serde_json::json!({ "success": true })))
}

/// POST /executions/log — live log line from a worker.
pub(crate) async fn append_log(
    State(state): State<Arc<ApiState>>,
    _auth: WorkerAuth,
    Json(req): Json<WorkerLogRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let Some(org_id) = req.org_id.as_deref() else {
        warn!(task_id = %req.task_id, "worker log without orgId, dropping");
        return Err(ApiError::BadRequest("orgId is required".into()));
    };

    state.cache.append_log(&req.task_id, &req.log).await;
    state.rooms.publish_to_org(
        org_id,
        RoomMessage::ExecutionLog {
            task_id: req.task_id,
            log: req.log,
        },
    );

    Ok(Json(serde_json::json!({ "success": true })))
}
