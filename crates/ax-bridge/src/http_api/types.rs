//! Request/response DTOs for the HTTP surface.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use ax_core::types::{
    CycleItemType, Environment, ExecutionStatus, ManualStep, Organization, ProjectEnvVar,
    TestRecord, Trigger, User, UserRole, SECRET_MASK,
};
use ax_harness::security::{validate_env_key, validate_env_value};

use crate::api_error::ApiError;

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignupRequest {
    pub org_name: String,
    pub org_slug: String,
    pub email: String,
    pub name: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub token: String,
    pub user: User,
    pub organization: Organization,
}

#[derive(Debug, Deserialize)]
pub struct RoleChangeRequest {
    pub role: UserRole,
}

#[derive(Debug, Deserialize)]
pub struct CreateApiKeyRequest {
    pub label: String,
}

/// The only response that ever carries API key plaintext.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyCreated {
    pub id: String,
    pub key: String,
    pub label: String,
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Limits for user-supplied dispatch input.
pub const MAX_RETRY_ATTEMPTS: u8 = 5;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequestConfig {
    pub environment: Environment,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub retry_attempts: Option<u8>,
    #[serde(default)]
    pub env_vars: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub task_id: String,
    pub image: String,
    #[serde(default)]
    pub folder: Option<String>,
    pub command: String,
    #[serde(default)]
    pub tests: Option<Vec<TestRecord>>,
    pub config: ExecutionRequestConfig,
    #[serde(default)]
    pub group_name: Option<String>,
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub trigger: Option<Trigger>,
    #[serde(default)]
    pub framework: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
}

impl ExecutionRequest {
    pub fn validate(&self) -> Result<(), ApiError> {
        if self.task_id.trim().is_empty() {
            return Err(ApiError::BadRequest("taskId must not be empty".into()));
        }
        if self.image.trim().is_empty() {
            return Err(ApiError::BadRequest("image must not be empty".into()));
        }
        if let Some(retries) = self.config.retry_attempts {
            if retries > MAX_RETRY_ATTEMPTS {
                return Err(ApiError::BadRequest(format!(
                    "retryAttempts must be between 0 and {MAX_RETRY_ATTEMPTS}"
                )));
            }
        }
        if let Some(vars) = &self.config.env_vars {
            for (key, value) in vars {
                validate_env_key(key)
                    .map_err(|e| ApiError::BadRequest(e.to_string()))?;
                validate_env_value(value)
                    .map_err(|e| ApiError::BadRequest(e.to_string()))?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Projects + env vars
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    pub slug: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateProjectRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEnvVarRequest {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub is_secret: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateEnvVarRequest {
    pub value: String,
    #[serde(default)]
    pub is_secret: Option<bool>,
}

/// Read-model for env vars: secret values are always masked.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvVarView {
    pub id: String,
    pub project_id: String,
    pub key: String,
    pub value: String,
    pub is_secret: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl From<&ProjectEnvVar> for EnvVarView {
    fn from(var: &ProjectEnvVar) -> Self {
        Self {
            id: var.id.clone(),
            project_id: var.project_id.clone(),
            key: var.key.clone(),
            value: if var.is_secret {
                SECRET_MASK.to_string()
            } else {
                var.value.clone().unwrap_or_default()
            },
            is_secret: var.is_secret,
            created_at: var.created_at,
            updated_at: var.updated_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Test cycles
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCycleItemRequest {
    #[serde(default)]
    pub test_case_id: Option<String>,
    #[serde(rename = "type")]
    pub item_type: CycleItemType,
    pub title: String,
    #[serde(default)]
    pub manual_steps: Option<Vec<ManualStep>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCycleRequest {
    pub project_id: String,
    pub name: String,
    #[serde(default)]
    pub items: Vec<CreateCycleItemRequest>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCycleItemRequest {
    pub status: String,
    #[serde(default)]
    pub execution_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Schedules
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateScheduleRequest {
    pub name: String,
    pub cron_expression: String,
    pub environment: Environment,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub folder: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Ingest
// ---------------------------------------------------------------------------

/// Batch bounds for `/api/ingest/event`.
pub const MAX_EVENTS_PER_BATCH: usize = 100;

/// Per-chunk size cap for log events.
pub const MAX_LOG_CHUNK: usize = 8192;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestSetupRequest {
    pub project_id: String,
    #[serde(default)]
    pub run_name: Option<String>,
    pub framework: String,
    pub reporter_version: String,
    pub total_tests: u32,
    #[serde(default)]
    pub environment: Option<Environment>,
    #[serde(default)]
    pub ci_context: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TestEndStatus {
    Passed,
    Failed,
    Skipped,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusEventKind {
    Running,
    Analyzing,
}

impl StatusEventKind {
    pub fn as_execution_status(self) -> ExecutionStatus {
        match self {
            StatusEventKind::Running => ExecutionStatus::Running,
            StatusEventKind::Analyzing => ExecutionStatus::Analyzing,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum IngestEvent {
    Log {
        #[serde(default)]
        test_id: Option<String>,
        chunk: String,
        timestamp: i64,
    },
    TestBegin {
        test_id: String,
        title: String,
        file: String,
        timestamp: i64,
    },
    TestEnd {
        test_id: String,
        status: TestEndStatus,
        duration: u64,
        #[serde(default)]
        error: Option<String>,
        timestamp: i64,
    },
    Status {
        status: StatusEventKind,
        timestamp: i64,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestEventRequest {
    pub session_id: String,
    pub events: Vec<IngestEvent>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TeardownStatus {
    Passed,
    Failed,
}

impl TeardownStatus {
    pub fn as_execution_status(self) -> ExecutionStatus {
        match self {
            TeardownStatus::Passed => ExecutionStatus::Passed,
            TeardownStatus::Failed => ExecutionStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct IngestSummary {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    #[serde(default)]
    pub skipped: u32,
    #[serde(default)]
    pub duration: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestTeardownRequest {
    pub session_id: String,
    pub status: TeardownStatus,
    pub summary: IngestSummary,
}

// ---------------------------------------------------------------------------
// Worker callbacks
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerUpdateRequest {
    pub task_id: String,
    #[serde(default)]
    pub org_id: Option<String>,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub end_time: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub output: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerLogRequest {
    pub task_id: String,
    #[serde(default)]
    pub org_id: Option<String>,
    pub log: String,
}

// ---------------------------------------------------------------------------
// Misc
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_request() -> ExecutionRequest {
        serde_json::from_value(serde_json::json!({
            "taskId": "t1",
            "image": "img:1",
            "command": "run",
            "config": {"environment": "staging"},
        }))
        .unwrap()
    }

    #[test]
    fn minimal_execution_request_parses_and_validates() {
        let req = base_request();
        assert!(req.validate().is_ok());
        assert_eq!(req.config.environment, Environment::Staging);
    }

    #[test]
    fn retry_attempts_out_of_range_rejected() {
        let mut req = base_request();
        req.config.retry_attempts = Some(6);
        assert!(matches!(req.validate(), Err(ApiError::BadRequest(_))));
        req.config.retry_attempts = Some(5);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn env_var_with_leading_digit_rejected() {
        let mut req = base_request();
        req.config.env_vars = Some(HashMap::from([(
            "1BAD".to_string(),
            "value".to_string(),
        )]));
        assert!(matches!(req.validate(), Err(ApiError::BadRequest(_))));
    }

    #[test]
    fn empty_image_rejected() {
        let mut req = base_request();
        req.image = "  ".into();
        assert!(matches!(req.validate(), Err(ApiError::BadRequest(_))));
    }

    #[test]
    fn ingest_events_parse_by_kind() {
        let req: IngestEventRequest = serde_json::from_value(serde_json::json!({
            "sessionId": "s1",
            "events": [
                {"type": "log", "chunk": "hello", "timestamp": 1},
                {"type": "test-begin", "testId": "t-a", "title": "A", "file": "a.spec.ts", "timestamp": 2},
                {"type": "test-end", "testId": "t-a", "status": "timedOut", "duration": 9, "timestamp": 3},
                {"type": "status", "status": "ANALYZING", "timestamp": 4},
            ],
        }))
        .unwrap();
        assert_eq!(req.events.len(), 4);
        assert!(matches!(
            req.events[2],
            IngestEvent::TestEnd {
                status: TestEndStatus::TimedOut,
                ..
            }
        ));
        assert!(matches!(
            req.events[3],
            IngestEvent::Status {
                status: StatusEventKind::Analyzing,
                ..
            }
        ));
    }

    #[test]
    fn secret_env_var_view_is_masked() {
        let now = chrono::Utc::now();
        let var = ProjectEnvVar {
            id: "v1".into(),
            org_id: "o".into(),
            project_id: "p".into(),
            key: "API_TOKEN".into(),
            value: None,
            encrypted: None,
            is_secret: true,
            created_at: now,
            updated_at: now,
        };
        let view = EnvVarView::from(&var);
        assert_eq!(view.value, SECRET_MASK);
    }
}
