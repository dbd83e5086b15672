use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use std::sync::Arc;

use ax_harness::plan::{current_month_start, current_period, LimitedAction, PlanEnforcer};

use crate::api_error::ApiError;
use crate::auth::developer_or_admin;
use crate::dispatch::DispatchError;

use super::state::ApiState;
use super::types::{ExecutionRequest, ListQuery};
use super::{pagination, CurrentUser};

/// POST /api/execution-request — the dispatch pipeline entry point.
///
/// Identity and role were resolved by the gate; this handler runs the plan
/// check and hands off to the [`Dispatcher`](crate::dispatch::Dispatcher).
pub(crate) async fn execution_request(
    State(state): State<Arc<ApiState>>,
    CurrentUser(principal): CurrentUser,
    Json(req): Json<ExecutionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    developer_or_admin(&principal)?;
    req.validate()?;

    let org = state.store.get_organization(&principal.org_id).await?;
    let check = PlanEnforcer::check(&state.store, &org, LimitedAction::RunTest).await?;
    if check.exceeded {
        return Err(ApiError::PlanLimit {
            limit: check.limit,
            current: check.used,
        });
    }

    let task_id = req.task_id.clone();
    state
        .dispatcher
        .dispatch(&principal.org_id, req)
        .await
        .map_err(|err| match err {
            DispatchError::Store(e) => e.into(),
            DispatchError::Queue(e) => ApiError::Internal(e.to_string()),
        })?;

    Ok(Json(serde_json::json!({
        "status": "Message queued successfully",
        "taskId": task_id,
    })))
}

/// GET /api/executions — the org's executions, newest first.
pub(crate) async fn list_executions(
    State(state): State<Arc<ApiState>>,
    CurrentUser(principal): CurrentUser,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let (limit, offset) = pagination(&query);
    let executions = state
        .store
        .list_executions(&principal.org_id, limit, offset)
        .await?;
    Ok(Json(executions))
}

/// GET /api/executions/{task_id} — org-scoped lookup.
pub(crate) async fn get_execution(
    State(state): State<Arc<ApiState>>,
    CurrentUser(principal): CurrentUser,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let execution = state
        .store
        .get_execution(&principal.org_id, &task_id)
        .await
        .map_err(|_| ApiError::NotFound("Execution not found".into()))?;
    Ok(Json(execution))
}

/// DELETE /api/executions/{task_id} — soft delete, uniform 404 when the
/// row is missing or belongs to another org.
pub(crate) async fn delete_execution(
    State(state): State<Arc<ApiState>>,
    CurrentUser(principal): CurrentUser,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    developer_or_admin(&principal)?;
    state
        .store
        .soft_delete_execution(&principal.org_id, &task_id)
        .await
        .map_err(|_| ApiError::NotFound("Execution not found".into()))?;
    Ok(Json(serde_json::json!({ "success": true })))
}

/// GET /api/metrics/{image} — cache-backed perf rollup, org-scoped key.
pub(crate) async fn image_metrics(
    State(state): State<Arc<ApiState>>,
    CurrentUser(principal): CurrentUser,
    Path(image): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let metrics = state
        .cache
        .get_image_metric(&principal.org_id, &image)
        .await
        .ok_or_else(|| ApiError::NotFound("No metrics for image".into()))?;
    Ok(Json(serde_json::json!({
        "image": image,
        "metrics": metrics,
    })))
}

/// GET /api/analytics/kpis — current-month rollup.
pub(crate) async fn kpis(
    State(state): State<Arc<ApiState>>,
    CurrentUser(principal): CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    let report = state
        .store
        .kpis(&principal.org_id, current_month_start(), &current_period())
        .await?;
    Ok(Json(report))
}
