use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use std::sync::Arc;

use ax_core::types::Project;
use ax_harness::plan::{LimitedAction, PlanEnforcer};
use ax_harness::security::{validate_slug, InputSanitizer};

use crate::api_error::ApiError;
use crate::auth::developer_or_admin;

use super::state::ApiState;
use super::types::{CreateProjectRequest, UpdateProjectRequest};
use super::CurrentUser;

/// GET /api/projects — all projects in the caller's org.
pub(crate) async fn list_projects(
    State(state): State<Arc<ApiState>>,
    CurrentUser(principal): CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    let projects = state.store.list_projects(&principal.org_id).await?;
    Ok(Json(projects))
}

/// POST /api/projects — create, plan-limited, slug unique per org.
pub(crate) async fn create_project(
    State(state): State<Arc<ApiState>>,
    CurrentUser(principal): CurrentUser,
    Json(req): Json<CreateProjectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    developer_or_admin(&principal)?;
    InputSanitizer::default()
        .sanitize(&req.name)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    validate_slug(&req.slug).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let org = state.store.get_organization(&principal.org_id).await?;
    let check = PlanEnforcer::check(&state.store, &org, LimitedAction::CreateProject).await?;
    if check.exceeded {
        return Err(ApiError::PlanLimit {
            limit: check.limit,
            current: check.used,
        });
    }

    let project = Project::new(&principal.org_id, &req.name, &req.slug);
    state
        .store
        .create_project(&project)
        .await
        .map_err(|err| match err {
            ax_store::StoreError::Conflict(_) => {
                ApiError::Conflict("Project slug already taken".into())
            }
            other => other.into(),
        })?;

    Ok((StatusCode::CREATED, Json(project)))
}

/// PUT /api/projects/{id} — rename.
pub(crate) async fn update_project(
    State(state): State<Arc<ApiState>>,
    CurrentUser(principal): CurrentUser,
    Path(id): Path<String>,
    Json(req): Json<UpdateProjectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    developer_or_admin(&principal)?;
    InputSanitizer::default()
        .sanitize(&req.name)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    state
        .store
        .update_project_name(&principal.org_id, &id, &req.name)
        .await
        .map_err(|_| ApiError::NotFound("Project not found".into()))?;
    let project = state.store.get_project(&principal.org_id, &id).await?;
    Ok(Json(project))
}

/// DELETE /api/projects/{id} — removes the project and its env vars.
pub(crate) async fn delete_project(
    State(state): State<Arc<ApiState>>,
    CurrentUser(principal): CurrentUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    developer_or_admin(&principal)?;
    state
        .store
        .delete_project(&principal.org_id, &id)
        .await
        .map_err(|_| ApiError::NotFound("Project not found".into()))?;
    Ok(Json(serde_json::json!({ "success": true })))
}
