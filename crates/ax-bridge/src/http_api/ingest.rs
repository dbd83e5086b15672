//! External-CI ingest sessions: setup → event stream → teardown.
//!
//! A session binds one reporter process to an Execution/TestCycle pair.
//! Log chunks and structured test events buffer in the cache (in-process
//! map when the cache is down) and drain into the store at teardown.
//! Event-batch cache writes are pipelined and fire-and-forget; responses
//! never wait on the cache.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use ax_cache::rate::RateTier;
use ax_cache::IngestBatch;
use ax_core::types::{
    CycleItem, CycleItemType, CycleStatus, CycleSummary, ExecConfig, Execution,
    ExecutionSource, ExecutionStatus, IngestMeta, IngestSession, TestCycle, TestRecord,
    Trigger, EXTERNAL_CI_IMAGE,
};
use ax_store::ExecutionPatch;

use crate::api_error::ApiError;
use crate::protocol::RoomMessage;

use super::state::ApiState;
use super::types::{
    IngestEvent, IngestEventRequest, IngestSetupRequest, IngestTeardownRequest,
    TestEndStatus, MAX_EVENTS_PER_BATCH, MAX_LOG_CHUNK,
};
use super::CurrentUser;

fn short_id() -> String {
    Uuid::new_v4().as_simple().to_string()[..8].to_string()
}

/// Load the session and confirm it belongs to the caller's org.
async fn authorized_session(
    state: &ApiState,
    principal_org: &str,
    session_id: &str,
) -> Result<IngestSession, ApiError> {
    let session = state
        .cache
        .get_session(session_id)
        .await
        .ok_or_else(|| ApiError::NotFound("Session not found".into()))?;
    if session.org_id != principal_org {
        return Err(ApiError::Forbidden(
            "Session does not belong to this organization".into(),
        ));
    }
    Ok(session)
}

// ---------------------------------------------------------------------------
// setup
// ---------------------------------------------------------------------------

/// POST /api/ingest/setup.
pub(crate) async fn setup(
    State(state): State<Arc<ApiState>>,
    CurrentUser(principal): CurrentUser,
    Json(req): Json<IngestSetupRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .rate
        .check(RateTier::IngestLifecycle, &principal.org_id)
        .await
        .map_err(|denied| ApiError::RateLimited(denied.message.to_string()))?;

    // Reporters hold a concrete project binding; a mismatch here is a
    // misconfigured reporter, reported as such rather than masked as 404.
    state
        .store
        .get_project(&principal.org_id, &req.project_id)
        .await
        .map_err(|_| {
            ApiError::Forbidden("Project does not belong to this organization".into())
        })?;

    let now = Utc::now();
    let session_id = Uuid::new_v4().to_string();
    let task_id = format!("ingest-{}-{}", now.timestamp_millis(), short_id());
    let cycle_id = Uuid::new_v4().to_string();
    let cycle_item_id = Uuid::new_v4().to_string();
    let run_name = req
        .run_name
        .clone()
        .unwrap_or_else(|| format!("{} run", req.framework));

    let cycle = TestCycle {
        id: cycle_id.clone(),
        org_id: principal.org_id.clone(),
        project_id: req.project_id.clone(),
        name: run_name.clone(),
        status: CycleStatus::Running,
        items: vec![CycleItem {
            id: cycle_item_id.clone(),
            test_case_id: None,
            item_type: CycleItemType::Automated,
            title: run_name.clone(),
            status: "RUNNING".into(),
            execution_id: Some(task_id.clone()),
            manual_steps: None,
        }],
        summary: CycleSummary {
            total: req.total_tests,
            ..CycleSummary::default()
        },
        created_at: now,
        updated_at: now,
    };
    state.store.create_test_cycle(&cycle).await?;

    let config = ExecConfig::new(
        req.environment
            .unwrap_or(ax_core::types::Environment::Dev),
    );
    let execution = Execution {
        task_id: task_id.clone(),
        org_id: principal.org_id.clone(),
        source: ExecutionSource::ExternalCi,
        status: ExecutionStatus::Running,
        image: EXTERNAL_CI_IMAGE.into(),
        command: EXTERNAL_CI_IMAGE.into(),
        folder: None,
        start_time: now,
        end_time: None,
        config,
        tests: vec![],
        output: None,
        trigger: Trigger::Webhook,
        group_name: Some(run_name),
        batch_id: None,
        cycle_id: Some(cycle_id.clone()),
        cycle_item_id: Some(cycle_item_id.clone()),
        ingest_meta: Some(IngestMeta {
            session_id: session_id.clone(),
            framework: req.framework.clone(),
            reporter_version: req.reporter_version.clone(),
            total_tests: req.total_tests,
            ci_context: req.ci_context.clone(),
        }),
        deleted_at: None,
    };
    state.store.upsert_execution(&execution).await?;

    let session = IngestSession {
        session_id: session_id.clone(),
        org_id: principal.org_id.clone(),
        project_id: req.project_id,
        task_id: task_id.clone(),
        cycle_id: cycle_id.clone(),
        cycle_item_id,
        framework: req.framework,
        reporter_version: req.reporter_version,
        total_tests: req.total_tests,
        status: "RUNNING".into(),
        start_time: now,
        created_at: now,
    };
    state.cache.put_session(&session).await;

    state
        .rooms
        .publish_to_org(&principal.org_id, RoomMessage::ExecutionUpdated(execution));

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "sessionId": session_id,
            "taskId": task_id,
            "cycleId": cycle_id,
        })),
    ))
}

// ---------------------------------------------------------------------------
// event
// ---------------------------------------------------------------------------

fn test_end_line(test_id: &str, status: TestEndStatus, duration: u64) -> String {
    let (icon, label) = match status {
        TestEndStatus::Passed => ("✔", "PASSED"),
        TestEndStatus::Skipped => ("–", "SKIPPED"),
        TestEndStatus::Failed => ("✘", "FAILED"),
        TestEndStatus::TimedOut => ("✘", "TIMED OUT"),
    };
    format!("{icon} {label}  {test_id} ({duration} ms)")
}

/// POST /api/ingest/event — apply a batch of reporter events in order.
pub(crate) async fn event(
    State(state): State<Arc<ApiState>>,
    CurrentUser(principal): CurrentUser,
    Json(req): Json<IngestEventRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .rate
        .check(RateTier::IngestEvent, &principal.org_id)
        .await
        .map_err(|denied| ApiError::RateLimited(denied.message.to_string()))?;

    if req.events.is_empty() || req.events.len() > MAX_EVENTS_PER_BATCH {
        return Err(ApiError::BadRequest(format!(
            "events must contain between 1 and {MAX_EVENTS_PER_BATCH} entries"
        )));
    }

    let session = authorized_session(&state, &principal.org_id, &req.session_id).await?;
    let org_id = session.org_id.clone();
    let task_id = session.task_id.clone();

    let mut batch = IngestBatch::new(&session.session_id, &task_id);
    let processed = req.events.len();

    for event in req.events {
        match event {
            IngestEvent::Log { chunk, .. } => {
                if chunk.len() > MAX_LOG_CHUNK {
                    return Err(ApiError::BadRequest(format!(
                        "log chunk exceeds {MAX_LOG_CHUNK} bytes"
                    )));
                }
                batch.log_append.push_str(&chunk);
                batch.log_append.push('\n');
                state.rooms.publish_to_org(
                    &org_id,
                    RoomMessage::ExecutionLog {
                        task_id: task_id.clone(),
                        log: chunk,
                    },
                );
            }
            IngestEvent::TestBegin { title, .. } => {
                let line = format!("▶ RUNNING  {title}");
                batch.log_append.push_str(&line);
                batch.log_append.push('\n');
                state.rooms.publish_to_org(
                    &org_id,
                    RoomMessage::ExecutionLog {
                        task_id: task_id.clone(),
                        log: line,
                    },
                );
            }
            IngestEvent::TestEnd {
                test_id,
                status,
                duration,
                error,
                timestamp,
            } => {
                let line = test_end_line(&test_id, status, duration);
                batch.log_append.push_str(&line);
                batch.log_append.push('\n');

                let record = TestRecord {
                    test_id,
                    status: serde_json::to_value(status)
                        .ok()
                        .and_then(|v| v.as_str().map(String::from))
                        .unwrap_or_else(|| "failed".into()),
                    duration,
                    error,
                    timestamp,
                };
                batch
                    .results
                    .push(serde_json::to_string(&record).expect("serialize record"));
                state.rooms.publish_to_org(
                    &org_id,
                    RoomMessage::ExecutionLog {
                        task_id: task_id.clone(),
                        log: line,
                    },
                );
            }
            IngestEvent::Status { status, .. } => {
                // Status events broadcast only; nothing lands in the cache.
                let patched = state
                    .store
                    .patch_execution(
                        &org_id,
                        &task_id,
                        ExecutionPatch {
                            status: Some(status.as_execution_status()),
                            ..Default::default()
                        },
                    )
                    .await?;
                state
                    .rooms
                    .publish_to_org(&org_id, RoomMessage::ExecutionUpdated(patched));
            }
        }
    }

    // One pipelined round-trip, off the response path. The batch also
    // slides the session TTL back out. Each detached write holds a drain
    // guard so graceful shutdown waits for it.
    if batch.is_empty() {
        let cache = Arc::clone(&state.cache);
        let session_id = session.session_id.clone();
        let guard = state.shutdown.register("ingest-session-touch");
        tokio::spawn(async move {
            cache.touch_session(&session_id).await;
            drop(guard);
        });
    } else {
        let cache = Arc::clone(&state.cache);
        let guard = state.shutdown.register("ingest-cache-batch");
        tokio::spawn(async move {
            cache.apply_batch(batch).await;
            drop(guard);
        });
    }

    Ok(Json(serde_json::json!({
        "success": true,
        "processed": processed,
    })))
}

// ---------------------------------------------------------------------------
// teardown
// ---------------------------------------------------------------------------

/// POST /api/ingest/teardown — drain buffers, finalize, archive.
pub(crate) async fn teardown(
    State(state): State<Arc<ApiState>>,
    CurrentUser(principal): CurrentUser,
    Json(req): Json<IngestTeardownRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .rate
        .check(RateTier::IngestLifecycle, &principal.org_id)
        .await
        .map_err(|denied| ApiError::RateLimited(denied.message.to_string()))?;

    let mut session = authorized_session(&state, &principal.org_id, &req.session_id).await?;
    let final_status = req.status.as_execution_status();

    let tests = state.cache.drain_results(&session.session_id).await;
    let output = state.cache.get_log(&session.task_id).await;

    let execution = state
        .store
        .patch_execution(
            &session.org_id,
            &session.task_id,
            ExecutionPatch {
                status: Some(final_status),
                end_time: Some(Utc::now()),
                output,
                tests: Some(tests),
            },
        )
        .await?;

    // Finalize the cycle: linked item terminal, cycle completed, summary
    // overwritten from the reporter's totals.
    let mut cycle = state
        .store
        .get_test_cycle(&session.org_id, &session.cycle_id)
        .await?;
    let item_status = match final_status {
        ExecutionStatus::Passed => "PASSED",
        _ => "FAILED",
    };
    if let Some(item) = cycle
        .items
        .iter_mut()
        .find(|item| item.id == session.cycle_item_id)
    {
        item.status = item_status.into();
    }
    cycle.status = CycleStatus::Completed;
    let automated = cycle
        .items
        .iter()
        .filter(|item| item.item_type == CycleItemType::Automated)
        .count() as u32;
    let total_items = cycle.items.len().max(1) as u32;
    cycle.summary = CycleSummary {
        total: req.summary.total,
        passed: req.summary.passed,
        failed: req.summary.failed,
        automation_rate: (automated as f64 / total_items as f64 * 1000.0).round() / 10.0,
    };
    state.store.save_test_cycle(&cycle).await?;

    session.status = match final_status {
        ExecutionStatus::Passed => "PASSED".into(),
        _ => "FAILED".into(),
    };
    state.store.archive_ingest_session(&session).await?;

    // Best-effort cache cleanup; a failure just leaves keys to expire.
    state.cache.delete_log(&session.task_id).await;
    state.cache.delete_results(&session.session_id).await;
    state.cache.delete_session(&session.session_id).await;

    state
        .rooms
        .publish_to_org(&session.org_id, RoomMessage::ExecutionUpdated(execution));

    Ok(Json(serde_json::json!({
        "success": true,
        "taskId": session.task_id,
        "status": session.status,
    })))
}
