//! Static report serving gated by signed tokens.
//!
//! `GET /reports/{orgId}/{taskId}/…` accepts the token from `?token=` or
//! from the path-scoped `report_token` cookie. A query-string token that
//! verifies sets the cookie so sub-resources (css, screenshots) load
//! without re-appending it.

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use std::path::{Component, PathBuf};
use std::sync::Arc;

use ax_core::report_token::REPORT_TOKEN_TTL_SECS;

use crate::api_error::ApiError;

use super::state::ApiState;

#[derive(Debug, Deserialize)]
pub(crate) struct ReportQuery {
    #[serde(default)]
    token: Option<String>,
}

fn cookie_token(headers: &HeaderMap) -> Option<String> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == "report_token").then(|| value.to_string())
    })
}

fn content_type_for(path: &std::path::Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("webm") => "video/webm",
        Some("mp4") => "video/mp4",
        Some("zip") => "application/zip",
        Some("txt") | Some("log") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

/// Reject path traversal and absolute components.
fn sanitize_relative(path: &str) -> Result<PathBuf, ApiError> {
    let rel = PathBuf::from(path);
    if rel
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(ApiError::BadRequest("invalid report path".into()));
    }
    Ok(rel)
}

/// GET /reports/{org_id}/{task_id}/{*path}.
pub(crate) async fn serve_report(
    State(state): State<Arc<ApiState>>,
    Path((org_id, task_id, path)): Path<(String, String, String)>,
    Query(query): Query<ReportQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    // Query token first (it can refresh the cookie), then the cookie.
    let mut set_cookie = false;
    let verified = if let Some(token) = &query.token {
        state
            .report_tokens
            .verify(token, &org_id, &task_id)
            .map(|()| {
                set_cookie = true;
            })
            .is_ok()
    } else {
        false
    };
    let verified = verified
        || cookie_token(&headers)
            .map(|token| {
                state
                    .report_tokens
                    .verify(&token, &org_id, &task_id)
                    .is_ok()
            })
            .unwrap_or(false);
    if !verified {
        return Err(ApiError::Unauthorized("Invalid or missing report token".into()));
    }

    let rel = sanitize_relative(&path)?;
    // Org and task ids become path segments; keep them to single
    // components as well.
    sanitize_relative(&org_id)?;
    sanitize_relative(&task_id)?;

    let full = PathBuf::from(&state.config.reports.dir)
        .join(&org_id)
        .join(&task_id)
        .join(&rel);

    let bytes = tokio::fs::read(&full)
        .await
        .map_err(|_| ApiError::NotFound("Report asset not found".into()))?;

    let mut response = (
        StatusCode::OK,
        [(header::CONTENT_TYPE, content_type_for(&full))],
        bytes,
    )
        .into_response();

    if set_cookie {
        let cookie = format!(
            "report_token={}; Path=/reports/{}/{}/; Max-Age={}; HttpOnly; SameSite=Lax",
            query.token.as_deref().unwrap_or_default(),
            org_id,
            task_id,
            REPORT_TOKEN_TTL_SECS,
        );
        if let Ok(value) = cookie.parse() {
            response.headers_mut().insert(header::SET_COOKIE, value);
        }
    }
    Ok(response)
}
