use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    Team,
    Enterprise,
}

/// Per-organization quota ceilings, set when the plan is assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrgLimits {
    pub max_projects: u64,
    pub max_test_runs: u64,
    pub max_users: u64,
    pub max_concurrent_runs: u64,
}

impl OrgLimits {
    /// Default ceilings for each plan tier.
    pub fn for_plan(plan: Plan) -> Self {
        match plan {
            Plan::Free => Self {
                max_projects: 3,
                max_test_runs: 100,
                max_users: 3,
                max_concurrent_runs: 1,
            },
            Plan::Team => Self {
                max_projects: 20,
                max_test_runs: 2_000,
                max_users: 15,
                max_concurrent_runs: 5,
            },
            Plan::Enterprise => Self {
                max_projects: 200,
                max_test_runs: 50_000,
                max_users: 500,
                max_concurrent_runs: 50,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Organization
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Organization {
    pub id: String,
    pub name: String,
    /// URL-safe handle, unique across all organizations.
    pub slug: String,
    pub plan: Plan,
    pub limits: OrgLimits,
    /// Plan feature flags (opaque to the core; billing owns the vocabulary).
    #[serde(default)]
    pub features: HashMap<String, bool>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Organization {
    pub fn new(name: impl Into<String>, slug: impl Into<String>, plan: Plan) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            slug: slug.into(),
            plan,
            limits: OrgLimits::for_plan(plan),
            features: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    Developer,
    Viewer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Active,
    Invited,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub org_id: String,
    /// Globally unique — an email belongs to exactly one organization.
    pub email: String,
    pub name: String,
    #[serde(skip_serializing)]
    pub hashed_password: String,
    pub role: UserRole,
    pub status: UserStatus,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(
        org_id: impl Into<String>,
        email: impl Into<String>,
        name: impl Into<String>,
        hashed_password: impl Into<String>,
        role: UserRole,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            org_id: org_id.into(),
            email: email.into(),
            name: name.into(),
            hashed_password: hashed_password.into(),
            role,
            status: UserStatus::Active,
            last_login_at: None,
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Principal
// ---------------------------------------------------------------------------

/// The authenticated caller identity threaded through every handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub user_id: String,
    pub org_id: String,
    pub role: UserRole,
}

impl Principal {
    /// `true` when the principal's role is in `allowed`.
    pub fn has_role(&self, allowed: &[UserRole]) -> bool {
        allowed.contains(&self.role)
    }
}

// ---------------------------------------------------------------------------
// ApiKey
// ---------------------------------------------------------------------------

/// A stored API key record. Only the SHA-256 hash of the key material is
/// persisted; the plaintext is shown once at creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKey {
    pub id: String,
    pub org_id: String,
    pub user_id: String,
    pub key_hash: String,
    pub label: String,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Project
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub org_id: String,
    pub name: String,
    /// Unique within the organization.
    pub slug: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn new(
        org_id: impl Into<String>,
        name: impl Into<String>,
        slug: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            org_id: org_id.into(),
            name: name.into(),
            slug: slug.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// ProjectEnvVar
// ---------------------------------------------------------------------------

/// AES-256-GCM envelope for a secret env-var value. All three fields are
/// base64-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    pub iv: String,
    pub ciphertext: String,
    pub tag: String,
}

/// A project-scoped environment variable. Secret values are stored only as
/// an [`EncryptedPayload`]; plain values are stored verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectEnvVar {
    pub id: String,
    pub org_id: String,
    pub project_id: String,
    pub key: String,
    /// Plaintext value when `is_secret` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Ciphertext envelope when `is_secret` is true.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted: Option<EncryptedPayload>,
    pub is_secret: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Placeholder returned in place of secret values on every read path.
pub const SECRET_MASK: &str = "********";

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Passed,
    Failed,
    Error,
    Unstable,
    Analyzing,
}

impl ExecutionStatus {
    /// Terminal statuses never transition again (annotations excepted).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Passed
                | ExecutionStatus::Failed
                | ExecutionStatus::Error
                | ExecutionStatus::Unstable
        )
    }
}

/// Where an execution's results come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionSource {
    /// Container started from a queue task message.
    #[serde(rename = "agnox-hosted")]
    AgnoxHosted,
    /// Results streamed in by an external-CI reporter; never runs a
    /// container (workers must skip the sentinel image).
    #[serde(rename = "external-ci")]
    ExternalCi,
}

/// Sentinel stored in `Execution::image` for external-CI rows.
pub const EXTERNAL_CI_IMAGE: &str = "external-ci";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Manual,
    Cron,
    Github,
    Gitlab,
    Jenkins,
    Webhook,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Staging,
    Prod,
}

/// Runtime configuration handed to the worker with each task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecConfig {
    pub environment: Environment,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default)]
    pub retry_attempts: u8,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
}

impl ExecConfig {
    pub fn new(environment: Environment) -> Self {
        Self {
            environment,
            base_url: None,
            retry_attempts: 0,
            env_vars: HashMap::new(),
        }
    }
}

/// One finished test inside an execution, as reported by a runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRecord {
    pub test_id: String,
    pub status: String,
    #[serde(default)]
    pub duration: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub timestamp: i64,
}

/// Reporter metadata attached to external-CI executions at session setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestMeta {
    pub session_id: String,
    pub framework: String,
    pub reporter_version: String,
    pub total_tests: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ci_context: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub task_id: String,
    pub org_id: String,
    pub source: ExecutionSource,
    pub status: ExecutionStatus,
    pub image: String,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub config: ExecConfig,
    #[serde(default)]
    pub tests: Vec<TestRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    pub trigger: Trigger,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cycle_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cycle_item_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingest_meta: Option<IngestMeta>,
    #[serde(skip_serializing)]
    pub deleted_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// TestCycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CycleStatus {
    Pending,
    Running,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CycleItemType {
    Manual,
    Automated,
}

/// One manually executed step inside a MANUAL cycle item.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualStep {
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleItem {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_case_id: Option<String>,
    #[serde(rename = "type")]
    pub item_type: CycleItemType,
    pub title: String,
    pub status: String,
    /// Back-reference by task id; the cycle does not own the execution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manual_steps: Option<Vec<ManualStep>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleSummary {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub automation_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCycle {
    pub id: String,
    pub org_id: String,
    pub project_id: String,
    pub name: String,
    pub status: CycleStatus,
    pub items: Vec<CycleItem>,
    pub summary: CycleSummary,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub id: String,
    pub org_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub name: String,
    pub cron_expression: String,
    pub environment: Environment,
    pub is_active: bool,
    pub image: String,
    pub folder: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// IngestSession
// ---------------------------------------------------------------------------

/// Cache-resident binding between an external-CI reporter process and one
/// Execution/TestCycle pair. Archived to the store at teardown.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestSession {
    pub session_id: String,
    pub org_id: String,
    pub project_id: String,
    pub task_id: String,
    pub cycle_id: String,
    pub cycle_item_id: String,
    pub framework: String,
    pub reporter_version: String,
    pub total_tests: u32,
    pub status: String,
    pub start_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}
