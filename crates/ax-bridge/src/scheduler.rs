//! In-process cron scheduler.
//!
//! Holds one tokio task per active schedule, keyed by schedule id. API
//! mutations call [`CronScheduler::add_job`] / [`remove_job`] so the
//! registry changes without a restart; startup loads every `is_active`
//! schedule from the store. Firing a schedule runs the dispatch pipeline
//! with `trigger=cron` and the schedule's name as the group.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use ax_core::types::{Schedule, Trigger};
use ax_store::StoreDb;

use crate::dispatch::Dispatcher;
use crate::http_api::types::{ExecutionRequest, ExecutionRequestConfig};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("invalid cron expression `{0}`")]
    InvalidExpression(String),
}

/// Parse a cron expression, accepting the classic 5-field form by
/// prefixing a zero seconds field.
pub fn parse_expression(expr: &str) -> Result<cron::Schedule, ScheduleError> {
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };
    cron::Schedule::from_str(&normalized)
        .map_err(|_| ScheduleError::InvalidExpression(expr.to_string()))
}

// ---------------------------------------------------------------------------
// CronScheduler
// ---------------------------------------------------------------------------

pub struct CronScheduler {
    dispatcher: Arc<Dispatcher>,
    jobs: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl CronScheduler {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Register a schedule. Idempotent: returns `false` when the id is
    /// already registered.
    pub fn add_job(&self, schedule: Schedule) -> Result<bool, ScheduleError> {
        let cron_schedule = parse_expression(&schedule.cron_expression)?;

        let mut jobs = self.jobs.lock().expect("scheduler lock poisoned");
        if jobs.contains_key(&schedule.id) {
            return Ok(false);
        }

        let dispatcher = Arc::clone(&self.dispatcher);
        let id = schedule.id.clone();
        info!(
            schedule_id = %id,
            expression = %schedule.cron_expression,
            "cron job registered"
        );
        let handle = tokio::spawn(run_schedule(dispatcher, schedule, cron_schedule));
        jobs.insert(id, handle);
        Ok(true)
    }

    /// Stop and remove a job. Returns `false` when it was not registered.
    pub fn remove_job(&self, schedule_id: &str) -> bool {
        let mut jobs = self.jobs.lock().expect("scheduler lock poisoned");
        match jobs.remove(schedule_id) {
            Some(handle) => {
                handle.abort();
                info!(schedule_id, "cron job removed");
                true
            }
            None => false,
        }
    }

    /// Stop every job (graceful shutdown).
    pub fn stop_all(&self) {
        let mut jobs = self.jobs.lock().expect("scheduler lock poisoned");
        let count = jobs.len();
        for (_, handle) in jobs.drain() {
            handle.abort();
        }
        if count > 0 {
            info!(count, "stopped all cron jobs");
        }
    }

    pub fn job_count(&self) -> usize {
        self.jobs.lock().expect("scheduler lock poisoned").len()
    }

    pub fn is_registered(&self, schedule_id: &str) -> bool {
        self.jobs
            .lock()
            .expect("scheduler lock poisoned")
            .contains_key(schedule_id)
    }

    /// Load all active schedules at startup. Invalid expressions are
    /// logged and skipped. Returns the number registered.
    pub async fn load_active(&self, store: &StoreDb) -> usize {
        let schedules = match store.list_active_schedules().await {
            Ok(schedules) => schedules,
            Err(err) => {
                warn!(error = %err, "failed to load schedules at startup");
                return 0;
            }
        };
        let mut loaded = 0;
        for schedule in schedules {
            match self.add_job(schedule.clone()) {
                Ok(true) => loaded += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(
                        schedule_id = %schedule.id,
                        error = %err,
                        "skipping schedule with invalid expression"
                    );
                }
            }
        }
        info!(loaded, "cron schedules loaded");
        loaded
    }
}

impl Drop for CronScheduler {
    fn drop(&mut self) {
        self.stop_all();
    }
}

// ---------------------------------------------------------------------------
// Job loop
// ---------------------------------------------------------------------------

async fn run_schedule(
    dispatcher: Arc<Dispatcher>,
    schedule: Schedule,
    cron_schedule: cron::Schedule,
) {
    loop {
        let Some(next) = cron_schedule.upcoming(Utc).next() else {
            // The expression has no future firing instants.
            return;
        };
        let wait = (next - Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        tokio::time::sleep(wait).await;

        let task_id = format!(
            "cron-{}-{}",
            Uuid::new_v4().as_simple(),
            Utc::now().timestamp_millis()
        );
        let request = ExecutionRequest {
            task_id: task_id.clone(),
            image: schedule.image.clone(),
            folder: Some(schedule.folder.clone()),
            command: "run".to_string(),
            tests: None,
            config: ExecutionRequestConfig {
                environment: schedule.environment,
                base_url: schedule.base_url.clone(),
                retry_attempts: None,
                env_vars: None,
            },
            group_name: Some(schedule.name.clone()),
            batch_id: None,
            trigger: Some(Trigger::Cron),
            framework: None,
            project_id: schedule.project_id.clone(),
        };

        match dispatcher.dispatch(&schedule.org_id, request).await {
            Ok(_) => info!(
                schedule_id = %schedule.id,
                task_id = %task_id,
                "cron schedule fired"
            ),
            Err(err) => warn!(
                schedule_id = %schedule.id,
                error = %err,
                "cron dispatch failed"
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rooms::RoomHub;
    use ax_core::types::Environment;
    use ax_queue::MemoryQueue;

    fn schedule(id: &str, expr: &str) -> Schedule {
        Schedule {
            id: id.into(),
            org_id: "org-a".into(),
            project_id: None,
            name: "nightly".into(),
            cron_expression: expr.into(),
            environment: Environment::Staging,
            is_active: true,
            image: "agnox/runner:1".into(),
            folder: "all".into(),
            base_url: None,
            created_at: Utc::now(),
        }
    }

    async fn scheduler_with_queue() -> (CronScheduler, Arc<MemoryQueue>) {
        let store = Arc::new(StoreDb::open_in_memory().await.unwrap());
        let queue = Arc::new(MemoryQueue::new());
        let dispatcher = Arc::new(Dispatcher::new(
            store,
            queue.clone(),
            RoomHub::new(),
            None,
            vec![],
        ));
        (CronScheduler::new(dispatcher), queue)
    }

    #[test]
    fn five_and_six_field_expressions_parse() {
        assert!(parse_expression("* * * * *").is_ok());
        assert!(parse_expression("0 0 2 * * *").is_ok());
        assert!(parse_expression("not a cron").is_err());
        assert!(parse_expression("99 * * * *").is_err());
    }

    #[tokio::test]
    async fn add_is_idempotent_and_remove_stops() {
        let (scheduler, _queue) = scheduler_with_queue().await;

        assert!(scheduler.add_job(schedule("s1", "0 0 2 * * *")).unwrap());
        assert!(!scheduler.add_job(schedule("s1", "0 0 2 * * *")).unwrap());
        assert_eq!(scheduler.job_count(), 1);
        assert!(scheduler.is_registered("s1"));

        assert!(scheduler.remove_job("s1"));
        assert!(!scheduler.remove_job("s1"));
        assert_eq!(scheduler.job_count(), 0);
    }

    #[tokio::test]
    async fn invalid_expression_rejected() {
        let (scheduler, _queue) = scheduler_with_queue().await;
        assert!(matches!(
            scheduler.add_job(schedule("s1", "nope")),
            Err(ScheduleError::InvalidExpression(_))
        ));
        assert_eq!(scheduler.job_count(), 0);
    }

    #[tokio::test]
    async fn every_second_schedule_fires_and_stops_after_removal() {
        let (scheduler, queue) = scheduler_with_queue().await;
        scheduler.add_job(schedule("s1", "* * * * * *")).unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(2_200)).await;
        let fired = queue.published().len();
        assert!(fired >= 1, "expected at least one firing, saw {fired}");
        let sample = &queue.published()[0].0;
        assert_eq!(sample.trigger, Some(Trigger::Cron));
        assert_eq!(sample.group_name.as_deref(), Some("nightly"));
        assert!(sample.task_id.starts_with("cron-"));

        scheduler.remove_job("s1");
        let after_removal = queue.published().len();
        tokio::time::sleep(std::time::Duration::from_millis(1_500)).await;
        assert_eq!(queue.published().len(), after_removal);
    }

    #[tokio::test]
    async fn stop_all_clears_registry() {
        let (scheduler, _queue) = scheduler_with_queue().await;
        scheduler.add_job(schedule("s1", "0 0 2 * * *")).unwrap();
        scheduler.add_job(schedule("s2", "0 0 3 * * *")).unwrap();
        scheduler.stop_all();
        assert_eq!(scheduler.job_count(), 0);
    }
}
