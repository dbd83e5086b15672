//! The dispatch pipeline.
//!
//! Takes a validated execution request that already passed the identity
//! gate and plan enforcer, resolves the project's env vars (decrypting
//! secrets in memory only), stamps org/task identity, upserts the PENDING
//! row, enqueues the priority-tagged task, and broadcasts to the org room.
//!
//! Ordering matters: the store write precedes the queue publish, and the
//! room broadcast is last, so any subscriber that sees PENDING can rely on
//! the row existing. A queue failure after the upsert leaves the PENDING
//! row behind for the reaper.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use ax_core::crypto::{decrypt_value, EnvKey};
use ax_core::types::{
    ExecConfig, Execution, ExecutionSource, ExecutionStatus, Trigger,
};
use ax_harness::security::strip_reserved_env;
use ax_queue::{priority_for, QueueError, TaskMessage, TaskPublisher};
use ax_store::{StoreDb, StoreError};

use crate::http_api::types::ExecutionRequest;
use crate::protocol::RoomMessage;
use crate::rooms::RoomHub;

/// Deadline on the queue publish so a hung broker cannot stall dispatch
/// responses indefinitely.
const PUBLISH_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Publish failed after the store upsert; the PENDING row remains.
    #[error("queue publish failed: {0}")]
    Queue(#[from] QueueError),
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub struct Dispatcher {
    store: Arc<StoreDb>,
    queue: Arc<dyn TaskPublisher>,
    rooms: RoomHub,
    env_key: Option<EnvKey>,
    inject_env_vars: Vec<String>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<StoreDb>,
        queue: Arc<dyn TaskPublisher>,
        rooms: RoomHub,
        env_key: Option<EnvKey>,
        inject_env_vars: Vec<String>,
    ) -> Self {
        Self {
            store,
            queue,
            rooms,
            env_key,
            inject_env_vars,
        }
    }

    /// Run the pipeline for one request. Returns the stored execution.
    pub async fn dispatch(
        &self,
        org_id: &str,
        request: ExecutionRequest,
    ) -> Result<Execution, DispatchError> {
        let trigger = request.trigger.unwrap_or(Trigger::Manual);

        // Project defaults first, then request values override them.
        let mut env_vars = match &request.project_id {
            Some(project_id) => self.resolve_project_env(org_id, project_id).await?,
            None => HashMap::new(),
        };
        if let Some(user_vars) = request.config.env_vars.clone() {
            env_vars.extend(user_vars);
        }

        // Server-side injection from the process environment.
        for name in &self.inject_env_vars {
            if let Ok(value) = std::env::var(name) {
                env_vars.insert(name.clone(), value);
            }
        }

        // Reserved prefix is dropped here and again at the worker.
        strip_reserved_env(&mut env_vars);

        let config = ExecConfig {
            environment: request.config.environment,
            base_url: request.config.base_url.clone(),
            retry_attempts: request.config.retry_attempts.unwrap_or(0),
            env_vars,
        };

        let execution = Execution {
            task_id: request.task_id.clone(),
            org_id: org_id.to_string(),
            source: ExecutionSource::AgnoxHosted,
            status: ExecutionStatus::Pending,
            image: request.image.clone(),
            command: request.command.clone(),
            folder: request.folder.clone(),
            start_time: Utc::now(),
            end_time: None,
            config: config.clone(),
            tests: request.tests.clone().unwrap_or_default(),
            output: None,
            trigger,
            group_name: request.group_name.clone(),
            batch_id: request.batch_id.clone(),
            cycle_id: None,
            cycle_item_id: None,
            ingest_meta: None,
            deleted_at: None,
        };
        self.store.upsert_execution(&execution).await?;

        let task = TaskMessage {
            task_id: execution.task_id.clone(),
            image: execution.image.clone(),
            command: execution.command.clone(),
            folder: execution.folder.clone(),
            organization_id: org_id.to_string(),
            config,
            tests: execution.tests.clone(),
            trigger: Some(trigger),
            group_name: execution.group_name.clone(),
            batch_id: execution.batch_id.clone(),
            framework: request.framework.clone(),
            cycle_id: None,
            cycle_item_id: None,
        };
        let priority = priority_for(trigger);
        match tokio::time::timeout(PUBLISH_TIMEOUT, self.queue.publish(&task, priority)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(DispatchError::Queue(QueueError::Amqp(
                    "publish timed out".into(),
                )))
            }
        }

        self.rooms
            .publish_to_org(org_id, RoomMessage::ExecutionUpdated(execution.clone()));

        info!(
            task_id = %execution.task_id,
            org_id,
            trigger = ?trigger,
            priority,
            "execution dispatched"
        );
        Ok(execution)
    }

    /// Load the project's env vars and decrypt secrets in memory.
    ///
    /// A secret that fails to decrypt is skipped with a warning rather than
    /// failing the whole dispatch.
    async fn resolve_project_env(
        &self,
        org_id: &str,
        project_id: &str,
    ) -> Result<HashMap<String, String>, StoreError> {
        let vars = self.store.list_env_vars(org_id, project_id).await?;
        let mut resolved = HashMap::with_capacity(vars.len());
        for var in vars {
            if var.is_secret {
                let Some(key) = &self.env_key else {
                    warn!(key = %var.key, "no encryption key configured, skipping secret");
                    continue;
                };
                let Some(envelope) = &var.encrypted else {
                    warn!(key = %var.key, "secret env var has no ciphertext, skipping");
                    continue;
                };
                match decrypt_value(key, envelope) {
                    Ok(plain) => {
                        resolved.insert(var.key, plain);
                    }
                    Err(err) => {
                        warn!(key = %var.key, error = %err, "failed to decrypt secret, skipping");
                    }
                }
            } else if let Some(value) = var.value {
                resolved.insert(var.key, value);
            }
        }
        Ok(resolved)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use ax_core::crypto::encrypt_value;
    use ax_core::types::{Organization, Plan, Project, ProjectEnvVar};
    use ax_queue::{MemoryQueue, QueueStats};
    use async_trait::async_trait;

    struct FailingQueue;

    #[async_trait]
    impl TaskPublisher for FailingQueue {
        async fn publish(&self, _: &TaskMessage, _: u8) -> Result<(), QueueError> {
            Err(QueueError::Amqp("broker down".into()))
        }
        async fn stats(&self) -> Result<QueueStats, QueueError> {
            Err(QueueError::Amqp("broker down".into()))
        }
    }

    fn request(task_id: &str) -> ExecutionRequest {
        serde_json::from_value(serde_json::json!({
            "taskId": task_id,
            "image": "img:1",
            "command": "run",
            "config": {"environment": "staging"},
        }))
        .unwrap()
    }

    async fn fixture(queue: Arc<dyn TaskPublisher>) -> (Dispatcher, Arc<StoreDb>, RoomHub) {
        let store = Arc::new(StoreDb::open_in_memory().await.unwrap());
        let org = Organization::new("Acme", "acme", Plan::Team);
        store.create_organization(&org).await.unwrap();
        let rooms = RoomHub::new();
        let dispatcher = Dispatcher::new(
            Arc::clone(&store),
            queue,
            rooms.clone(),
            Some(EnvKey::generate().unwrap()),
            vec![],
        );
        (dispatcher, store, rooms)
    }

    #[tokio::test]
    async fn dispatch_upserts_publishes_and_broadcasts() {
        let queue = Arc::new(MemoryQueue::new());
        let (dispatcher, store, rooms) = fixture(queue.clone()).await;
        let rx = rooms.subscribe("org:org-a");

        let execution = dispatcher.dispatch("org-a", request("t1")).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Pending);
        assert_eq!(execution.source, ExecutionSource::AgnoxHosted);

        // Store row exists.
        store.get_execution("org-a", "t1").await.unwrap();

        // One queue message with manual priority, orgId stamped.
        let published = queue.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0.organization_id, "org-a");
        assert_eq!(published[0].1, 5);

        // Broadcast reached the org room.
        let msg = rx.try_recv().unwrap();
        assert!(matches!(&*msg, RoomMessage::ExecutionUpdated(e) if e.task_id == "t1"));
    }

    #[tokio::test]
    async fn project_defaults_resolved_and_overridden() {
        let queue = Arc::new(MemoryQueue::new());
        let store = Arc::new(StoreDb::open_in_memory().await.unwrap());
        let env_key = EnvKey::generate().unwrap();
        let project = Project::new("org-a", "Checkout", "checkout");
        store.create_project(&project).await.unwrap();

        let now = Utc::now();
        for (key, value, secret) in [
            ("BASE_URL", Some("http://default"), false),
            ("OVERRIDE_ME", Some("from-project"), false),
        ] {
            store
                .create_env_var(&ProjectEnvVar {
                    id: uuid::Uuid::new_v4().to_string(),
                    org_id: "org-a".into(),
                    project_id: project.id.clone(),
                    key: key.into(),
                    value: value.map(String::from),
                    encrypted: None,
                    is_secret: secret,
                    created_at: now,
                    updated_at: now,
                })
                .await
                .unwrap();
        }
        // One encrypted secret.
        store
            .create_env_var(&ProjectEnvVar {
                id: uuid::Uuid::new_v4().to_string(),
                org_id: "org-a".into(),
                project_id: project.id.clone(),
                key: "DB_PASSWORD".into(),
                value: None,
                encrypted: Some(encrypt_value(&env_key, "hunter2").unwrap()),
                is_secret: true,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        let dispatcher = Dispatcher::new(
            Arc::clone(&store),
            queue.clone(),
            RoomHub::new(),
            Some(env_key),
            vec![],
        );

        let mut req = request("t1");
        req.project_id = Some(project.id.clone());
        req.config.env_vars = Some(HashMap::from([(
            "OVERRIDE_ME".to_string(),
            "from-request".to_string(),
        )]));

        dispatcher.dispatch("org-a", req).await.unwrap();

        let vars = &queue.published()[0].0.config.env_vars;
        assert_eq!(vars["BASE_URL"], "http://default");
        assert_eq!(vars["OVERRIDE_ME"], "from-request");
        assert_eq!(vars["DB_PASSWORD"], "hunter2");
    }

    #[tokio::test]
    async fn platform_prefix_never_reaches_workers() {
        let queue = Arc::new(MemoryQueue::new());
        let (dispatcher, _store, _rooms) = fixture(queue.clone()).await;

        let mut req = request("t1");
        req.config.env_vars = Some(HashMap::from([
            ("PLATFORM_API_KEY".to_string(), "leak".to_string()),
            ("SAFE".to_string(), "ok".to_string()),
        ]));
        dispatcher.dispatch("org-a", req).await.unwrap();

        let vars = &queue.published()[0].0.config.env_vars;
        assert!(!vars.contains_key("PLATFORM_API_KEY"));
        assert_eq!(vars["SAFE"], "ok");
    }

    #[tokio::test]
    async fn cron_trigger_uses_lower_priority() {
        let queue = Arc::new(MemoryQueue::new());
        let (dispatcher, _store, _rooms) = fixture(queue.clone()).await;

        let mut req = request("t1");
        req.trigger = Some(Trigger::Cron);
        req.group_name = Some("nightly".into());
        let execution = dispatcher.dispatch("org-a", req).await.unwrap();

        assert_eq!(execution.trigger, Trigger::Cron);
        assert_eq!(queue.published()[0].1, 2);
    }

    #[tokio::test]
    async fn queue_failure_leaves_pending_row() {
        let (dispatcher, store, rooms) = fixture(Arc::new(FailingQueue)).await;
        let rx = rooms.subscribe("org:org-a");

        let err = dispatcher.dispatch("org-a", request("t1")).await.unwrap_err();
        assert!(matches!(err, DispatchError::Queue(_)));

        // The upsert committed; no broadcast went out.
        let row = store.get_execution("org-a", "t1").await.unwrap();
        assert_eq!(row.status, ExecutionStatus::Pending);
        assert!(rx.try_recv().is_err());
    }
}
