use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, warn};

use ax_core::types::{IngestSession, TestRecord};

use crate::memory::MemoryCache;

// ---------------------------------------------------------------------------
// TTLs + keys
// ---------------------------------------------------------------------------

/// Sliding TTL for cache-resident ingest sessions.
pub const SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Shorter TTL when a session lives in the in-process fallback map.
pub const FALLBACK_SESSION_TTL: Duration = Duration::from_secs(4 * 60 * 60);

/// TTL for live log buffers.
pub const LOG_TTL: Duration = Duration::from_secs(4 * 60 * 60);

/// TTL for per-image perf rollups.
const PERF_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

fn session_key(session_id: &str) -> String {
    format!("ingest:session:{session_id}")
}

fn log_key(task_id: &str) -> String {
    format!("live:logs:{task_id}")
}

fn results_key(session_id: &str) -> String {
    format!("ingest:results:{session_id}")
}

fn perf_key(org_id: &str, image: &str) -> String {
    format!("perf:{org_id}:{image}")
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("redis: {0}")]
    Redis(String),
    #[error("no shared cache configured")]
    NoSharedCache,
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::Redis(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// IngestBatch
// ---------------------------------------------------------------------------

/// Accumulated cache writes for one ingest event batch.
///
/// Everything here lands in a single pipelined round-trip; the HTTP response
/// never waits on it.
#[derive(Debug, Default)]
pub struct IngestBatch {
    pub session_id: String,
    pub task_id: String,
    /// Concatenated log text (chunks and formatted lines, already newline
    /// terminated) to APPEND to `live:logs:{task_id}`.
    pub log_append: String,
    /// Serialized test records to RPUSH onto `ingest:results:{session_id}`.
    pub results: Vec<String>,
}

impl IngestBatch {
    pub fn new(session_id: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            task_id: task_id.into(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.log_append.is_empty() && self.results.is_empty()
    }
}

// ---------------------------------------------------------------------------
// LiveCache
// ---------------------------------------------------------------------------

/// Shared-cache facade with a per-operation in-process fallback.
pub struct LiveCache {
    redis: Option<ConnectionManager>,
    fallback: MemoryCache,
    /// Set while operations are being served by the fallback map, so the
    /// degradation is logged once per episode rather than per request.
    degraded: AtomicBool,
}

impl LiveCache {
    /// Connect to redis; the fallback map is still armed behind it.
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self {
            redis: Some(manager),
            fallback: MemoryCache::new(),
            degraded: AtomicBool::new(false),
        })
    }

    /// Memory-only cache (tests, cache-less development).
    pub fn memory() -> Self {
        Self {
            redis: None,
            fallback: MemoryCache::new(),
            degraded: AtomicBool::new(false),
        }
    }

    pub fn has_shared_cache(&self) -> bool {
        self.redis.is_some()
    }

    fn note_degraded(&self, err: &CacheError) {
        if !self.degraded.swap(true, Ordering::Relaxed) {
            warn!(error = %err, "cache unreachable, serving from in-process fallback map");
        }
    }

    fn note_recovered(&self) {
        if self.degraded.swap(false, Ordering::Relaxed) {
            debug!("shared cache reachable again");
        }
    }

    // -----------------------------------------------------------------------
    // Ingest sessions
    // -----------------------------------------------------------------------

    /// Store a session; falls back to the in-process map (shorter TTL) when
    /// the shared cache write fails. Returns `true` when the fallback was
    /// used.
    pub async fn put_session(&self, session: &IngestSession) -> bool {
        let key = session_key(&session.session_id);
        let json = serde_json::to_string(session).expect("serialize session");
        if let Some(redis) = &self.redis {
            let mut con = redis.clone();
            let outcome: Result<(), redis::RedisError> =
                con.set_ex(&key, &json, SESSION_TTL.as_secs()).await;
            match outcome {
                Ok(()) => {
                    self.note_recovered();
                    return false;
                }
                Err(err) => self.note_degraded(&err.into()),
            }
        }
        self.fallback.set_text(&key, json, FALLBACK_SESSION_TTL);
        true
    }

    pub async fn get_session(&self, session_id: &str) -> Option<IngestSession> {
        let key = session_key(session_id);
        if let Some(redis) = &self.redis {
            let mut con = redis.clone();
            let outcome: Result<Option<String>, redis::RedisError> = con.get(&key).await;
            match outcome {
                Ok(Some(json)) => {
                    self.note_recovered();
                    return serde_json::from_str(&json).ok();
                }
                Ok(None) => {
                    self.note_recovered();
                    // A session written during an outage may only exist in
                    // the fallback map.
                }
                Err(err) => self.note_degraded(&err.into()),
            }
        }
        self.fallback
            .get_text(&key)
            .and_then(|json| serde_json::from_str(&json).ok())
    }

    /// Slide the session TTL back out to 24 h (4 h in the fallback).
    pub async fn touch_session(&self, session_id: &str) {
        let key = session_key(session_id);
        if let Some(redis) = &self.redis {
            let mut con = redis.clone();
            let outcome: Result<i64, redis::RedisError> =
                con.expire(&key, SESSION_TTL.as_secs() as i64).await;
            if outcome.is_ok() {
                return;
            }
        }
        self.fallback.touch(&key, FALLBACK_SESSION_TTL);
    }

    pub async fn delete_session(&self, session_id: &str) {
        self.delete(&session_key(session_id)).await;
    }

    // -----------------------------------------------------------------------
    // Live logs
    // -----------------------------------------------------------------------

    /// Append a chunk to the task's live log buffer and reset its TTL.
    pub async fn append_log(&self, task_id: &str, chunk: &str) {
        let key = log_key(task_id);
        if let Some(redis) = &self.redis {
            let mut con = redis.clone();
            let outcome: Result<(), redis::RedisError> = redis::pipe()
                .append(&key, chunk)
                .ignore()
                .expire(&key, LOG_TTL.as_secs() as i64)
                .ignore()
                .query_async(&mut con)
                .await;
            match outcome {
                Ok(()) => {
                    self.note_recovered();
                    return;
                }
                Err(err) => self.note_degraded(&err.into()),
            }
        }
        self.fallback.append_text(&key, chunk, LOG_TTL);
    }

    pub async fn get_log(&self, task_id: &str) -> Option<String> {
        let key = log_key(task_id);
        if let Some(redis) = &self.redis {
            let mut con = redis.clone();
            let outcome: Result<Option<String>, redis::RedisError> = con.get(&key).await;
            match outcome {
                Ok(found @ Some(_)) => {
                    self.note_recovered();
                    return found;
                }
                Ok(None) => self.note_recovered(),
                Err(err) => self.note_degraded(&err.into()),
            }
        }
        self.fallback.get_text(&key)
    }

    pub async fn delete_log(&self, task_id: &str) {
        self.delete(&log_key(task_id)).await;
    }

    // -----------------------------------------------------------------------
    // Structured results
    // -----------------------------------------------------------------------

    /// Read back every structured test record for a session, oldest first.
    pub async fn drain_results(&self, session_id: &str) -> Vec<TestRecord> {
        let key = results_key(session_id);
        let raw: Vec<String> = if let Some(redis) = &self.redis {
            let mut con = redis.clone();
            let outcome: Result<Vec<String>, redis::RedisError> =
                con.lrange(&key, 0, -1).await;
            match outcome {
                Ok(items) if !items.is_empty() => {
                    self.note_recovered();
                    items
                }
                Ok(_) => {
                    self.note_recovered();
                    self.fallback.get_list(&key)
                }
                Err(err) => {
                    self.note_degraded(&err.into());
                    self.fallback.get_list(&key)
                }
            }
        } else {
            self.fallback.get_list(&key)
        };
        raw.iter()
            .filter_map(|item| serde_json::from_str(item).ok())
            .collect()
    }

    pub async fn delete_results(&self, session_id: &str) {
        self.delete(&results_key(session_id)).await;
    }

    // -----------------------------------------------------------------------
    // Batched ingest writes
    // -----------------------------------------------------------------------

    /// Apply one event batch's cache writes in a single pipeline.
    pub async fn apply_batch(&self, batch: IngestBatch) {
        if batch.is_empty() {
            return;
        }
        if let Some(redis) = &self.redis {
            let mut con = redis.clone();
            let mut pipe = redis::pipe();
            if !batch.log_append.is_empty() {
                let key = log_key(&batch.task_id);
                pipe.append(&key, &batch.log_append).ignore();
                pipe.expire(&key, LOG_TTL.as_secs() as i64).ignore();
            }
            if !batch.results.is_empty() {
                let key = results_key(&batch.session_id);
                for record in &batch.results {
                    pipe.rpush(&key, record).ignore();
                }
                pipe.expire(&key, SESSION_TTL.as_secs() as i64).ignore();
            }
            pipe.expire(
                &session_key(&batch.session_id),
                SESSION_TTL.as_secs() as i64,
            )
            .ignore();
            let outcome: Result<(), redis::RedisError> = pipe.query_async(&mut con).await;
            match outcome {
                Ok(()) => {
                    self.note_recovered();
                    return;
                }
                Err(err) => self.note_degraded(&err.into()),
            }
        }
        if !batch.log_append.is_empty() {
            self.fallback
                .append_text(&log_key(&batch.task_id), &batch.log_append, LOG_TTL);
        }
        let results_key = results_key(&batch.session_id);
        for record in batch.results {
            self.fallback.push_list(&results_key, record, SESSION_TTL);
        }
        self.fallback
            .touch(&session_key(&batch.session_id), FALLBACK_SESSION_TTL);
    }

    // -----------------------------------------------------------------------
    // Perf rollups
    // -----------------------------------------------------------------------

    pub async fn put_image_metric(&self, org_id: &str, image: &str, value: serde_json::Value) {
        let key = perf_key(org_id, image);
        let json = value.to_string();
        if let Some(redis) = &self.redis {
            let mut con = redis.clone();
            let outcome: Result<(), redis::RedisError> =
                con.set_ex(&key, &json, PERF_TTL.as_secs()).await;
            if outcome.is_ok() {
                return;
            }
        }
        self.fallback.set_text(&key, json, PERF_TTL);
    }

    pub async fn get_image_metric(
        &self,
        org_id: &str,
        image: &str,
    ) -> Option<serde_json::Value> {
        let key = perf_key(org_id, image);
        if let Some(redis) = &self.redis {
            let mut con = redis.clone();
            let outcome: Result<Option<String>, redis::RedisError> = con.get(&key).await;
            if let Ok(Some(json)) = outcome {
                return serde_json::from_str(&json).ok();
            }
        }
        self.fallback
            .get_text(&key)
            .and_then(|json| serde_json::from_str(&json).ok())
    }

    // -----------------------------------------------------------------------
    // Rate windows
    // -----------------------------------------------------------------------

    /// Shared-cache fixed-window counter. Errors when no shared cache is
    /// reachable so the caller can drop to its local limiter.
    pub async fn incr_window(&self, key: &str, window_secs: i64) -> Result<u64, CacheError> {
        let redis = self.redis.as_ref().ok_or(CacheError::NoSharedCache)?;
        let mut con = redis.clone();
        let (count,): (u64,) = redis::pipe()
            .atomic()
            .incr(key, 1u64)
            .expire(key, window_secs)
            .ignore()
            .query_async(&mut con)
            .await?;
        Ok(count)
    }

    // -----------------------------------------------------------------------
    // Housekeeping
    // -----------------------------------------------------------------------

    async fn delete(&self, key: &str) {
        if let Some(redis) = &self.redis {
            let mut con = redis.clone();
            let _: Result<i64, redis::RedisError> = con.del(key).await;
        }
        self.fallback.delete(key);
    }

    /// Sweep expired fallback entries; returns the number removed.
    pub fn sweep_fallback(&self) -> usize {
        self.fallback.sweep()
    }

    /// Background sweeper for the fallback map. Runs until process exit and
    /// never blocks it.
    pub fn start_fallback_sweeper(self: &Arc<Self>, interval: Duration) {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = cache.sweep_fallback();
                if removed > 0 {
                    debug!(removed, "swept expired fallback cache entries");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn session(id: &str) -> IngestSession {
        IngestSession {
            session_id: id.into(),
            org_id: "org-a".into(),
            project_id: "p1".into(),
            task_id: "ingest-1-abc".into(),
            cycle_id: "c1".into(),
            cycle_item_id: "ci1".into(),
            framework: "playwright".into(),
            reporter_version: "1.0.0".into(),
            total_tests: 2,
            status: "RUNNING".into(),
            start_time: Utc::now(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn memory_session_round_trip() {
        let cache = LiveCache::memory();
        let used_fallback = cache.put_session(&session("s1")).await;
        assert!(used_fallback);

        let loaded = cache.get_session("s1").await.unwrap();
        assert_eq!(loaded.task_id, "ingest-1-abc");

        cache.delete_session("s1").await;
        assert!(cache.get_session("s1").await.is_none());
    }

    #[tokio::test]
    async fn log_appends_accumulate_in_order() {
        let cache = LiveCache::memory();
        cache.append_log("t1", "first\n").await;
        cache.append_log("t1", "second\n").await;
        assert_eq!(cache.get_log("t1").await.as_deref(), Some("first\nsecond\n"));
    }

    #[tokio::test]
    async fn batch_applies_logs_and_results() {
        let cache = LiveCache::memory();
        cache.put_session(&session("s1")).await;

        let mut batch = IngestBatch::new("s1", "t1");
        batch.log_append.push_str("▶ RUNNING  A\n");
        batch.results.push(
            serde_json::json!({"testId": "t-a", "status": "passed", "duration": 12, "timestamp": 1})
                .to_string(),
        );
        cache.apply_batch(batch).await;

        assert!(cache.get_log("t1").await.unwrap().contains("RUNNING"));
        let results = cache.drain_results("s1").await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].test_id, "t-a");
    }

    #[tokio::test]
    async fn drain_skips_unparseable_records() {
        let cache = LiveCache::memory();
        let mut batch = IngestBatch::new("s1", "t1");
        batch.results.push("not json".to_string());
        batch.results.push(
            serde_json::json!({"testId": "t-b", "status": "failed", "duration": 5, "timestamp": 2})
                .to_string(),
        );
        cache.apply_batch(batch).await;
        let results = cache.drain_results("s1").await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, "failed");
    }

    #[tokio::test]
    async fn incr_window_requires_shared_cache() {
        let cache = LiveCache::memory();
        assert!(matches!(
            cache.incr_window("rate:general:org-a:1", 60).await,
            Err(CacheError::NoSharedCache)
        ));
    }

    #[tokio::test]
    async fn perf_metric_round_trip() {
        let cache = LiveCache::memory();
        cache
            .put_image_metric("org-a", "img:1", serde_json::json!({"avgDurationMs": 1200}))
            .await;
        let metric = cache.get_image_metric("org-a", "img:1").await.unwrap();
        assert_eq!(metric["avgDurationMs"], 1200);
        assert!(cache.get_image_metric("org-b", "img:1").await.is_none());
    }
}
