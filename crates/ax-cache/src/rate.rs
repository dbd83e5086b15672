//! Per-organization request rate control.
//!
//! The authoritative counter is a fixed one-minute window in the shared
//! cache (`INCR` + `EXPIRE` per key), so limits hold across instances. When
//! the cache is unreachable each instance falls back to its local token
//! bucket — enforcement precision degrades, availability does not.

use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use ax_harness::rate_limiter::{RateLimitConfig, RateLimiter};

use crate::live::LiveCache;

// ---------------------------------------------------------------------------
// Tiers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateTier {
    /// General API traffic.
    General,
    /// Ingest setup/teardown.
    IngestLifecycle,
    /// Ingest event batches.
    IngestEvent,
}

impl RateTier {
    pub fn per_minute(&self) -> u64 {
        match self {
            RateTier::General => 100,
            RateTier::IngestLifecycle => 100,
            RateTier::IngestEvent => 500,
        }
    }

    fn key_part(&self) -> &'static str {
        match self {
            RateTier::General => "general",
            RateTier::IngestLifecycle => "ingest-lifecycle",
            RateTier::IngestEvent => "ingest-event",
        }
    }

    /// Human-readable refusal message for 429 responses.
    pub fn message(&self) -> &'static str {
        match self {
            RateTier::General => "Too many requests, slow down and retry shortly",
            RateTier::IngestLifecycle => {
                "Too many ingest session operations, slow down and retry shortly"
            }
            RateTier::IngestEvent => {
                "Too many ingest event batches, buffer events client-side and retry"
            }
        }
    }
}

// ---------------------------------------------------------------------------
// RateControl
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct RateDenied {
    pub message: &'static str,
}

pub struct RateControl {
    cache: Arc<LiveCache>,
    general_fallback: RateLimiter,
    lifecycle_fallback: RateLimiter,
    event_fallback: RateLimiter,
}

impl RateControl {
    pub fn new(cache: Arc<LiveCache>) -> Self {
        Self {
            cache,
            general_fallback: RateLimiter::new(RateLimitConfig::per_minute(
                RateTier::General.per_minute(),
            )),
            lifecycle_fallback: RateLimiter::new(RateLimitConfig::per_minute(
                RateTier::IngestLifecycle.per_minute(),
            )),
            event_fallback: RateLimiter::new(RateLimitConfig::per_minute(
                RateTier::IngestEvent.per_minute(),
            )),
        }
    }

    /// Admit or refuse one request for `org_id` on `tier`.
    pub async fn check(&self, tier: RateTier, org_id: &str) -> Result<(), RateDenied> {
        let minute = Utc::now().timestamp() / 60;
        let key = format!("rate:{}:{}:{}", tier.key_part(), org_id, minute);

        match self.cache.incr_window(&key, 120).await {
            Ok(count) => {
                if count > tier.per_minute() {
                    debug!(org_id, tier = tier.key_part(), count, "rate limit exceeded");
                    return Err(RateDenied {
                        message: tier.message(),
                    });
                }
                Ok(())
            }
            Err(_) => {
                let limiter = match tier {
                    RateTier::General => &self.general_fallback,
                    RateTier::IngestLifecycle => &self.lifecycle_fallback,
                    RateTier::IngestEvent => &self.event_fallback,
                };
                limiter.check(org_id).map_err(|_| RateDenied {
                    message: tier.message(),
                })
            }
        }
    }

    /// Prune idle fallback buckets (called from the sweeper interval).
    pub fn cleanup(&self) {
        self.general_fallback.cleanup();
        self.lifecycle_fallback.cleanup();
        self.event_fallback.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control() -> RateControl {
        RateControl::new(Arc::new(LiveCache::memory()))
    }

    #[tokio::test]
    async fn general_tier_allows_burst_then_blocks() {
        let control = control();
        for _ in 0..RateTier::General.per_minute() {
            control.check(RateTier::General, "org-a").await.unwrap();
        }
        let denied = control.check(RateTier::General, "org-a").await.unwrap_err();
        assert!(denied.message.contains("Too many requests"));
    }

    #[tokio::test]
    async fn tiers_are_independent() {
        let control = control();
        for _ in 0..RateTier::IngestLifecycle.per_minute() {
            control
                .check(RateTier::IngestLifecycle, "org-a")
                .await
                .unwrap();
        }
        assert!(control.check(RateTier::IngestLifecycle, "org-a").await.is_err());
        // The event tier still has headroom.
        control.check(RateTier::IngestEvent, "org-a").await.unwrap();
    }

    #[tokio::test]
    async fn orgs_are_independent() {
        let control = control();
        for _ in 0..RateTier::General.per_minute() {
            control.check(RateTier::General, "org-a").await.unwrap();
        }
        assert!(control.check(RateTier::General, "org-a").await.is_err());
        control.check(RateTier::General, "org-b").await.unwrap();
    }
}
