//! Project env-var CRUD.
//!
//! Secret values are encrypted with the process AES-256-GCM key before the
//! store sees them and masked on every read path; the only place plaintext
//! reappears is the dispatch pipeline's in-memory merge.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use ax_core::crypto::encrypt_value;
use ax_core::types::ProjectEnvVar;
use ax_harness::security::{
    validate_env_key, validate_env_value, MAX_ENV_VARS_PER_PROJECT,
};

use crate::api_error::ApiError;
use crate::auth::developer_or_admin;

use super::state::ApiState;
use super::types::{CreateEnvVarRequest, EnvVarView, UpdateEnvVarRequest};
use super::CurrentUser;

/// Encrypt `value` when `is_secret`, otherwise keep plaintext.
fn materialize(
    state: &ApiState,
    value: String,
    is_secret: bool,
) -> Result<(Option<String>, Option<ax_core::types::EncryptedPayload>), ApiError> {
    if !is_secret {
        return Ok((Some(value), None));
    }
    let key = state.env_key.as_ref().ok_or_else(|| {
        ApiError::BadRequest("Secret env vars require an encryption key to be configured".into())
    })?;
    let envelope =
        encrypt_value(key, &value).map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok((None, Some(envelope)))
}

/// GET /api/projects/{id}/env — masked listing.
pub(crate) async fn list_env_vars(
    State(state): State<Arc<ApiState>>,
    CurrentUser(principal): CurrentUser,
    Path(project_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    developer_or_admin(&principal)?;
    // Confirm the project exists in this org before listing.
    state
        .store
        .get_project(&principal.org_id, &project_id)
        .await
        .map_err(|_| ApiError::NotFound("Project not found".into()))?;

    let vars = state
        .store
        .list_env_vars(&principal.org_id, &project_id)
        .await?;
    let views: Vec<EnvVarView> = vars.iter().map(EnvVarView::from).collect();
    Ok(Json(views))
}

/// POST /api/projects/{id}/env — create one variable.
pub(crate) async fn create_env_var(
    State(state): State<Arc<ApiState>>,
    CurrentUser(principal): CurrentUser,
    Path(project_id): Path<String>,
    Json(req): Json<CreateEnvVarRequest>,
) -> Result<impl IntoResponse, ApiError> {
    developer_or_admin(&principal)?;
    validate_env_key(&req.key).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    validate_env_value(&req.value).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    state
        .store
        .get_project(&principal.org_id, &project_id)
        .await
        .map_err(|_| ApiError::NotFound("Project not found".into()))?;

    let existing = state
        .store
        .count_env_vars(&principal.org_id, &project_id)
        .await?;
    if existing >= MAX_ENV_VARS_PER_PROJECT {
        return Err(ApiError::BadRequest(format!(
            "Projects are limited to {MAX_ENV_VARS_PER_PROJECT} env vars"
        )));
    }

    let (value, encrypted) = materialize(&state, req.value, req.is_secret)?;
    let now = Utc::now();
    let var = ProjectEnvVar {
        id: Uuid::new_v4().to_string(),
        org_id: principal.org_id.clone(),
        project_id,
        key: req.key,
        value,
        encrypted,
        is_secret: req.is_secret,
        created_at: now,
        updated_at: now,
    };
    state
        .store
        .create_env_var(&var)
        .await
        .map_err(|err| match err {
            ax_store::StoreError::Conflict(_) => {
                ApiError::Conflict("Env var key already exists for this project".into())
            }
            other => other.into(),
        })?;

    Ok((StatusCode::CREATED, Json(EnvVarView::from(&var))))
}

/// PUT /api/projects/{id}/env/{var_id} — update value and/or secrecy.
pub(crate) async fn update_env_var(
    State(state): State<Arc<ApiState>>,
    CurrentUser(principal): CurrentUser,
    Path((project_id, var_id)): Path<(String, String)>,
    Json(req): Json<UpdateEnvVarRequest>,
) -> Result<impl IntoResponse, ApiError> {
    developer_or_admin(&principal)?;
    validate_env_value(&req.value).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let mut var = state
        .store
        .get_env_var(&principal.org_id, &var_id)
        .await
        .map_err(|_| ApiError::NotFound("Env var not found".into()))?;
    if var.project_id != project_id {
        return Err(ApiError::NotFound("Env var not found".into()));
    }

    let is_secret = req.is_secret.unwrap_or(var.is_secret);
    let (value, encrypted) = materialize(&state, req.value, is_secret)?;
    var.value = value;
    var.encrypted = encrypted;
    var.is_secret = is_secret;
    state.store.update_env_var(&var).await?;

    Ok(Json(EnvVarView::from(&var)))
}

/// DELETE /api/projects/{id}/env/{var_id}.
pub(crate) async fn delete_env_var(
    State(state): State<Arc<ApiState>>,
    CurrentUser(principal): CurrentUser,
    Path((project_id, var_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    developer_or_admin(&principal)?;

    let var = state
        .store
        .get_env_var(&principal.org_id, &var_id)
        .await
        .map_err(|_| ApiError::NotFound("Env var not found".into()))?;
    if var.project_id != project_id {
        return Err(ApiError::NotFound("Env var not found".into()));
    }

    state.store.delete_env_var(&principal.org_id, &var_id).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}
