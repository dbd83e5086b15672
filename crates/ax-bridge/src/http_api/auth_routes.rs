use argon2::password_hash::{rand_core::OsRng, PasswordHash, SaltString};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use axum::{extract::Path, extract::State, http::StatusCode, response::IntoResponse, Json};
use chrono::Utc;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use ax_core::types::{ApiKey, Organization, OrgLimits, Plan, User, UserRole};
use ax_harness::security::{validate_slug, InputSanitizer};

use crate::api_error::ApiError;
use crate::auth::{admin_only, generate_api_key, hash_api_key};

use super::state::ApiState;
use super::types::{
    ApiKeyCreated, AuthResponse, CreateApiKeyRequest, LoginRequest, RoleChangeRequest,
    SignupRequest,
};
use super::CurrentUser;

// ---------------------------------------------------------------------------
// Password hashing
// ---------------------------------------------------------------------------

fn hash_password(password: &str) -> Result<String, ApiError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| ApiError::Internal(format!("password hash: {e}")))
}

fn verify_password(password: &str, hash: &str) -> bool {
    PasswordHash::new(hash)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// POST /api/auth/signup — create an organization and its first admin.
pub(crate) async fn signup(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<SignupRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let sanitizer = InputSanitizer::default();
    sanitizer
        .sanitize(&req.org_name)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    sanitizer
        .sanitize(&req.name)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    validate_slug(&req.org_slug).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    if !req.email.contains('@') {
        return Err(ApiError::BadRequest("invalid email".into()));
    }
    if req.password.len() < 8 {
        return Err(ApiError::BadRequest(
            "password must be at least 8 characters".into(),
        ));
    }

    let org = Organization::new(&req.org_name, &req.org_slug, Plan::Free);
    state
        .store
        .create_organization(&org)
        .await
        .map_err(|err| match err {
            ax_store::StoreError::Conflict(_) => {
                ApiError::Conflict("Organization slug already taken".into())
            }
            other => other.into(),
        })?;

    let hashed = hash_password(&req.password)?;
    let user = User::new(&org.id, &req.email, &req.name, hashed, UserRole::Admin);
    state
        .store
        .create_user(&user)
        .await
        .map_err(|err| match err {
            ax_store::StoreError::Conflict(_) => {
                ApiError::Conflict("Email already registered".into())
            }
            other => other.into(),
        })?;

    let token = state.auth_keys.issue(&user)?;
    Ok((
        StatusCode::CREATED,
        Json(AuthResponse {
            token,
            user,
            organization: org,
        }),
    ))
}

/// POST /api/auth/login — credential check, returns a fresh JWT.
pub(crate) async fn login(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, ApiError> {
    let user = state
        .store
        .find_user_by_email(&req.email)
        .await?
        .filter(|user| verify_password(&req.password, &user.hashed_password))
        .ok_or_else(|| ApiError::Unauthorized("Invalid email or password".into()))?;

    if let Err(err) = state.store.update_last_login(&user.id).await {
        warn!(error = %err, "failed to stamp last login");
    }

    let organization = state.store.get_organization(&user.org_id).await?;
    let token = state.auth_keys.issue(&user)?;
    Ok(Json(AuthResponse {
        token,
        user,
        organization,
    }))
}

/// GET /api/auth/me — the principal and its organization.
pub(crate) async fn me(
    State(state): State<Arc<ApiState>>,
    CurrentUser(principal): CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    let user = state
        .store
        .get_user(&principal.org_id, &principal.user_id)
        .await?;
    let organization = state.store.get_organization(&principal.org_id).await?;
    Ok(Json(serde_json::json!({
        "user": user,
        "organization": organization,
    })))
}

/// PATCH /api/users/{id}/role — admin-only role change with the last-admin
/// guard.
pub(crate) async fn change_role(
    State(state): State<Arc<ApiState>>,
    CurrentUser(principal): CurrentUser,
    Path(user_id): Path<String>,
    Json(req): Json<RoleChangeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    admin_only(&principal)?;

    if user_id == principal.user_id {
        return Err(ApiError::Forbidden("You cannot change your own role".into()));
    }

    let target = state
        .store
        .get_user(&principal.org_id, &user_id)
        .await
        .map_err(|_| ApiError::NotFound("User not found".into()))?;

    if target.role == UserRole::Admin
        && req.role != UserRole::Admin
        && state.store.count_admins(&principal.org_id).await? <= 1
    {
        return Err(ApiError::Forbidden(
            "Organization must retain at least one admin".into(),
        ));
    }

    state
        .store
        .update_user_role(&principal.org_id, &user_id, req.role)
        .await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

/// POST /api/api-keys — mint reporter credentials; plaintext shown once.
pub(crate) async fn create_api_key(
    State(state): State<Arc<ApiState>>,
    CurrentUser(principal): CurrentUser,
    Json(req): Json<CreateApiKeyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    admin_only(&principal)?;
    InputSanitizer::default()
        .sanitize(&req.label)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let key_material = generate_api_key();
    let record = ApiKey {
        id: Uuid::new_v4().to_string(),
        org_id: principal.org_id.clone(),
        user_id: principal.user_id.clone(),
        key_hash: hash_api_key(&key_material),
        label: req.label.clone(),
        last_used_at: None,
        created_at: Utc::now(),
    };
    state.store.create_api_key(&record).await?;

    Ok((
        StatusCode::CREATED,
        Json(ApiKeyCreated {
            id: record.id,
            key: key_material,
            label: req.label,
        }),
    ))
}

/// GET /api/plans — public plan catalogue.
pub(crate) async fn list_plans() -> Json<serde_json::Value> {
    let plans = [Plan::Free, Plan::Team, Plan::Enterprise]
        .into_iter()
        .map(|plan| {
            serde_json::json!({
                "plan": plan,
                "limits": OrgLimits::for_plan(plan),
            })
        })
        .collect::<Vec<_>>();
    Json(serde_json::json!({ "plans": plans }))
}
