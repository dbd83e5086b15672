use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use ax_core::types::Schedule;
use ax_harness::security::InputSanitizer;

use crate::api_error::ApiError;
use crate::auth::developer_or_admin;
use crate::scheduler::parse_expression;

use super::state::ApiState;
use super::types::CreateScheduleRequest;
use super::CurrentUser;

/// GET /api/schedules.
pub(crate) async fn list_schedules(
    State(state): State<Arc<ApiState>>,
    CurrentUser(principal): CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    let schedules = state.store.list_schedules(&principal.org_id).await?;
    Ok(Json(schedules))
}

/// POST /api/schedules — persist and register with the running scheduler.
pub(crate) async fn create_schedule(
    State(state): State<Arc<ApiState>>,
    CurrentUser(principal): CurrentUser,
    Json(req): Json<CreateScheduleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    developer_or_admin(&principal)?;
    InputSanitizer::default()
        .sanitize(&req.name)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    parse_expression(&req.cron_expression)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    if let Some(project_id) = &req.project_id {
        state
            .store
            .get_project(&principal.org_id, project_id)
            .await
            .map_err(|_| ApiError::NotFound("Project not found".into()))?;
    }

    let schedule = Schedule {
        id: Uuid::new_v4().to_string(),
        org_id: principal.org_id.clone(),
        project_id: req.project_id,
        name: req.name,
        cron_expression: req.cron_expression,
        environment: req.environment,
        is_active: true,
        image: req
            .image
            .unwrap_or_else(|| state.config.defaults.image.clone()),
        folder: req.folder.unwrap_or_else(|| "all".into()),
        base_url: req.base_url,
        created_at: Utc::now(),
    };
    state.store.create_schedule(&schedule).await?;

    state
        .scheduler
        .add_job(schedule.clone())
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    Ok((StatusCode::CREATED, Json(schedule)))
}

/// DELETE /api/schedules/{id} — remove from store and scheduler.
pub(crate) async fn delete_schedule(
    State(state): State<Arc<ApiState>>,
    CurrentUser(principal): CurrentUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    developer_or_admin(&principal)?;
    state
        .store
        .delete_schedule(&principal.org_id, &id)
        .await
        .map_err(|_| ApiError::NotFound("Schedule not found".into()))?;
    state.scheduler.remove_job(&id);
    Ok(Json(serde_json::json!({ "success": true })))
}
