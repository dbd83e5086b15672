//! Durable tenant-scoped storage for the Agnox producer.
//!
//! SQLite behind [`tokio_rusqlite`]; every query that touches tenant data is
//! filtered by `org_id`. Unique keys stand in for application-level locking:
//! executions upsert by `(task_id, org_id)`, project slugs and env-var keys
//! collide at the constraint layer and surface as [`StoreError::Conflict`].

mod cycles;
mod error;
mod executions;
mod projects;
mod schedules;
mod store;
mod tenants;

pub use error::StoreError;
pub use executions::{ExecutionPatch, KpiReport};
pub use store::StoreDb;
