//! Task queue adapter.
//!
//! The producer's single hand-off point to remote workers: a durable AMQP
//! priority queue (`x-max-priority=10`, persistent messages). Workers run
//! with prefetch=1 so priorities keep any one organization from
//! monopolising the fleet. The declare is idempotent — the queue is never
//! redeclared with different arguments — and `stats` introspects passively.

use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::info;

use ax_core::types::{ExecConfig, TestRecord, Trigger};

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

/// The task message a stateless worker needs to run a container end-to-end.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMessage {
    pub task_id: String,
    pub image: String,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
    pub organization_id: String,
    pub config: ExecConfig,
    #[serde(default)]
    pub tests: Vec<TestRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<Trigger>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub framework: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cycle_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cycle_item_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Priorities
// ---------------------------------------------------------------------------

/// Maximum priority level the queue is declared with.
pub const MAX_PRIORITY: u8 = 10;

/// Priority for image-prefetch background tasks.
pub const PRIORITY_PREFETCH: u8 = 1;

/// Queue priority for a trigger, clamped to `[1, MAX_PRIORITY]`.
pub fn priority_for(trigger: Trigger) -> u8 {
    let p = match trigger {
        Trigger::Manual => 5,
        Trigger::Github | Trigger::Gitlab | Trigger::Jenkins | Trigger::Webhook => 4,
        Trigger::Cron => 2,
    };
    p.clamp(1, MAX_PRIORITY)
}

// ---------------------------------------------------------------------------
// Errors + stats
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("amqp: {0}")]
    Amqp(String),
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<lapin::Error> for QueueError {
    fn from(err: lapin::Error) -> Self {
        QueueError::Amqp(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub message_count: u32,
    pub consumer_count: u32,
}

// ---------------------------------------------------------------------------
// TaskPublisher
// ---------------------------------------------------------------------------

#[async_trait]
pub trait TaskPublisher: Send + Sync {
    /// Enqueue a task with the given priority (clamped by the impl).
    async fn publish(&self, task: &TaskMessage, priority: u8) -> Result<(), QueueError>;

    /// Passive queue introspection.
    async fn stats(&self) -> Result<QueueStats, QueueError>;
}

// ---------------------------------------------------------------------------
// AmqpQueue
// ---------------------------------------------------------------------------

pub struct AmqpQueue {
    channel: Channel,
    queue_name: String,
}

impl AmqpQueue {
    /// Connect and idempotently declare the durable priority queue.
    pub async fn connect(url: &str, queue_name: &str) -> Result<Self, QueueError> {
        let connection = Connection::connect(url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;

        let mut args = FieldTable::default();
        args.insert("x-max-priority".into(), AMQPValue::LongInt(MAX_PRIORITY as i32));
        channel
            .queue_declare(
                queue_name,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                args,
            )
            .await?;

        info!(queue = queue_name, "task queue declared");
        Ok(Self {
            channel,
            queue_name: queue_name.to_string(),
        })
    }
}

#[async_trait]
impl TaskPublisher for AmqpQueue {
    async fn publish(&self, task: &TaskMessage, priority: u8) -> Result<(), QueueError> {
        let payload = serde_json::to_vec(task)?;
        let properties = BasicProperties::default()
            .with_delivery_mode(2) // persistent
            .with_priority(priority.clamp(1, MAX_PRIORITY));

        self.channel
            .basic_publish(
                "",
                &self.queue_name,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await?
            .await?;
        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let queue = self
            .channel
            .queue_declare(
                &self.queue_name,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(QueueStats {
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }
}

// ---------------------------------------------------------------------------
// MemoryQueue
// ---------------------------------------------------------------------------

/// Records published tasks in memory. Used by tests and queue-less dev runs.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    published: Mutex<Vec<(TaskMessage, u8)>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything published so far.
    pub fn published(&self) -> Vec<(TaskMessage, u8)> {
        self.published.lock().expect("queue lock poisoned").clone()
    }

    /// Tasks grouped by organization, for fairness assertions.
    pub fn published_by_org(&self) -> HashMap<String, usize> {
        let mut by_org = HashMap::new();
        for (task, _) in self.published() {
            *by_org.entry(task.organization_id).or_insert(0) += 1;
        }
        by_org
    }
}

#[async_trait]
impl TaskPublisher for MemoryQueue {
    async fn publish(&self, task: &TaskMessage, priority: u8) -> Result<(), QueueError> {
        self.published
            .lock()
            .expect("queue lock poisoned")
            .push((task.clone(), priority.clamp(1, MAX_PRIORITY)));
        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        Ok(QueueStats {
            message_count: self.published.lock().expect("queue lock poisoned").len() as u32,
            consumer_count: 0,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
