use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use ax_core::types::{CycleItem, CycleStatus, CycleSummary, TestCycle};
use ax_harness::security::InputSanitizer;

use crate::api_error::ApiError;
use crate::auth::developer_or_admin;

use super::state::ApiState;
use super::types::{CreateCycleRequest, UpdateCycleItemRequest};
use super::CurrentUser;

/// GET /api/test-cycles — all cycles in the caller's org, newest first.
pub(crate) async fn list_cycles(
    State(state): State<Arc<ApiState>>,
    CurrentUser(principal): CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    let cycles = state.store.list_test_cycles(&principal.org_id).await?;
    Ok(Json(cycles))
}

/// GET /api/test-cycles/{id}.
pub(crate) async fn get_cycle(
    State(state): State<Arc<ApiState>>,
    CurrentUser(principal): CurrentUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let cycle = state
        .store
        .get_test_cycle(&principal.org_id, &id)
        .await
        .map_err(|_| ApiError::NotFound("Test cycle not found".into()))?;
    Ok(Json(cycle))
}

/// POST /api/test-cycles — create a cycle with its initial items.
pub(crate) async fn create_cycle(
    State(state): State<Arc<ApiState>>,
    CurrentUser(principal): CurrentUser,
    Json(req): Json<CreateCycleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    developer_or_admin(&principal)?;
    InputSanitizer::default()
        .sanitize(&req.name)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    state
        .store
        .get_project(&principal.org_id, &req.project_id)
        .await
        .map_err(|_| ApiError::NotFound("Project not found".into()))?;

    let items: Vec<CycleItem> = req
        .items
        .into_iter()
        .map(|item| CycleItem {
            id: Uuid::new_v4().to_string(),
            test_case_id: item.test_case_id,
            item_type: item.item_type,
            title: item.title,
            status: "PENDING".into(),
            execution_id: None,
            manual_steps: item.manual_steps,
        })
        .collect();

    let now = Utc::now();
    let cycle = TestCycle {
        id: Uuid::new_v4().to_string(),
        org_id: principal.org_id.clone(),
        project_id: req.project_id,
        name: req.name,
        status: CycleStatus::Pending,
        summary: CycleSummary {
            total: items.len() as u32,
            ..CycleSummary::default()
        },
        items,
        created_at: now,
        updated_at: now,
    };
    state.store.create_test_cycle(&cycle).await?;
    Ok((StatusCode::CREATED, Json(cycle)))
}

/// PUT /api/test-cycles/{id}/items/{item_id} — manual item status updates.
pub(crate) async fn update_cycle_item(
    State(state): State<Arc<ApiState>>,
    CurrentUser(principal): CurrentUser,
    Path((cycle_id, item_id)): Path<(String, String)>,
    Json(req): Json<UpdateCycleItemRequest>,
) -> Result<impl IntoResponse, ApiError> {
    developer_or_admin(&principal)?;

    let mut cycle = state
        .store
        .get_test_cycle(&principal.org_id, &cycle_id)
        .await
        .map_err(|_| ApiError::NotFound("Test cycle not found".into()))?;

    let item = cycle
        .items
        .iter_mut()
        .find(|item| item.id == item_id)
        .ok_or_else(|| ApiError::NotFound("Cycle item not found".into()))?;
    item.status = req.status;
    if let Some(execution_id) = req.execution_id {
        item.execution_id = Some(execution_id);
    }

    refresh_summary(&mut cycle);
    state.store.save_test_cycle(&cycle).await?;
    Ok(Json(cycle))
}

/// Recompute the cycle summary from item states.
pub(crate) fn refresh_summary(cycle: &mut TestCycle) {
    let total = cycle.items.len() as u32;
    let passed = cycle
        .items
        .iter()
        .filter(|item| item.status.eq_ignore_ascii_case("PASSED"))
        .count() as u32;
    let failed = cycle
        .items
        .iter()
        .filter(|item| item.status.eq_ignore_ascii_case("FAILED"))
        .count() as u32;
    let automated = cycle
        .items
        .iter()
        .filter(|item| item.item_type == ax_core::types::CycleItemType::Automated)
        .count() as u32;
    cycle.summary = CycleSummary {
        total,
        passed,
        failed,
        automation_rate: if total == 0 {
            0.0
        } else {
            (automated as f64 / total as f64 * 1000.0).round() / 10.0
        },
    };
}
