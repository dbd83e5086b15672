//! HTTP + WebSocket surface of the Agnox producer.
//!
//! Everything request-scoped lives here: the identity gate, the dispatch
//! pipeline, per-organization realtime rooms, the ingest session manager,
//! the cron scheduler, and the REST routes that tie them to the store,
//! cache, and task queue.

pub mod api_error;
pub mod auth;
pub mod dispatch;
pub mod http_api;
pub mod protocol;
pub mod rooms;
pub mod scheduler;
pub mod websocket;
