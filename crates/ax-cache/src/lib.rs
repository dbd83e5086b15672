//! Transient state for the producer: live logs, ingest sessions, structured
//! result buffers, per-image perf rollups, and rate-control windows.
//!
//! Redis is authoritative when reachable; every operation degrades to an
//! in-process map so a cache outage never surfaces to callers. The fallback
//! is a single-instance safety net only — clustered deployments must keep
//! the cache up (degradation is logged for exactly that reason).

mod live;
mod memory;
pub mod rate;

pub use live::{CacheError, IngestBatch, LiveCache};
pub use memory::MemoryCache;
