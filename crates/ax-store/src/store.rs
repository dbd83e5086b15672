use std::path::Path;

use tokio_rusqlite::Connection;

use crate::StoreError;

/// Async SQLite-backed store for all durable producer state.
pub struct StoreDb {
    pub(crate) conn: Connection,
}

// ---------------------------------------------------------------------------
// helpers – enum <-> SQLite string
// ---------------------------------------------------------------------------

pub(crate) fn enum_to_sql<T: serde::Serialize>(val: &T) -> String {
    let s = serde_json::to_string(val).expect("serialize enum");
    s.trim_matches('"').to_string()
}

pub(crate) fn enum_from_sql<T: serde::de::DeserializeOwned>(raw: &str) -> T {
    let quoted = format!("\"{}\"", raw);
    serde_json::from_str(&quoted).expect("deserialize enum")
}

impl StoreDb {
    /// Open (or create) a database at the given file path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref()).await?;
        let db = Self { conn };
        db.init_schema().await?;
        Ok(db)
    }

    /// Create a purely in-memory database (tests, ephemeral runs).
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        let db = Self { conn };
        db.init_schema().await?;
        Ok(db)
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    async fn init_schema(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;
                    PRAGMA foreign_keys=ON;

                    CREATE TABLE IF NOT EXISTS organizations (
                        id          TEXT PRIMARY KEY,
                        name        TEXT NOT NULL,
                        slug        TEXT NOT NULL UNIQUE,
                        plan        TEXT NOT NULL,
                        limits      TEXT NOT NULL,
                        features    TEXT NOT NULL DEFAULT '{}',
                        created_at  TEXT NOT NULL,
                        updated_at  TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS users (
                        id              TEXT PRIMARY KEY,
                        org_id          TEXT NOT NULL,
                        email           TEXT NOT NULL UNIQUE,
                        name            TEXT NOT NULL,
                        hashed_password TEXT NOT NULL,
                        role            TEXT NOT NULL,
                        status          TEXT NOT NULL,
                        last_login_at   TEXT,
                        created_at      TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_users_org ON users(org_id);

                    CREATE TABLE IF NOT EXISTS api_keys (
                        id            TEXT PRIMARY KEY,
                        org_id        TEXT NOT NULL,
                        user_id       TEXT NOT NULL,
                        key_hash      TEXT NOT NULL UNIQUE,
                        label         TEXT NOT NULL,
                        last_used_at  TEXT,
                        created_at    TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS projects (
                        id          TEXT PRIMARY KEY,
                        org_id      TEXT NOT NULL,
                        name        TEXT NOT NULL,
                        slug        TEXT NOT NULL,
                        created_at  TEXT NOT NULL,
                        updated_at  TEXT NOT NULL,
                        UNIQUE(org_id, slug)
                    );

                    CREATE INDEX IF NOT EXISTS idx_projects_org ON projects(org_id);

                    CREATE TABLE IF NOT EXISTS project_env_vars (
                        id          TEXT PRIMARY KEY,
                        org_id      TEXT NOT NULL,
                        project_id  TEXT NOT NULL,
                        key         TEXT NOT NULL,
                        value       TEXT,
                        encrypted   TEXT,
                        is_secret   INTEGER NOT NULL DEFAULT 0,
                        created_at  TEXT NOT NULL,
                        updated_at  TEXT NOT NULL,
                        UNIQUE(org_id, project_id, key)
                    );

                    CREATE INDEX IF NOT EXISTS idx_env_vars_project
                        ON project_env_vars(org_id, project_id);

                    CREATE TABLE IF NOT EXISTS executions (
                        task_id       TEXT NOT NULL,
                        org_id        TEXT NOT NULL,
                        source        TEXT NOT NULL,
                        status        TEXT NOT NULL,
                        image         TEXT NOT NULL,
                        command       TEXT NOT NULL,
                        folder        TEXT,
                        start_time    TEXT NOT NULL,
                        end_time      TEXT,
                        config        TEXT NOT NULL,
                        tests         TEXT NOT NULL DEFAULT '[]',
                        output        TEXT,
                        trigger_kind  TEXT NOT NULL,
                        group_name    TEXT,
                        batch_id      TEXT,
                        cycle_id      TEXT,
                        cycle_item_id TEXT,
                        ingest_meta   TEXT,
                        deleted_at    TEXT,
                        PRIMARY KEY (task_id, org_id)
                    );

                    CREATE INDEX IF NOT EXISTS idx_executions_org_start
                        ON executions(org_id, start_time);

                    CREATE TABLE IF NOT EXISTS test_cycles (
                        id          TEXT PRIMARY KEY,
                        org_id      TEXT NOT NULL,
                        project_id  TEXT NOT NULL,
                        name        TEXT NOT NULL,
                        status      TEXT NOT NULL,
                        items       TEXT NOT NULL DEFAULT '[]',
                        summary     TEXT NOT NULL,
                        created_at  TEXT NOT NULL,
                        updated_at  TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_cycles_org ON test_cycles(org_id);

                    CREATE TABLE IF NOT EXISTS schedules (
                        id              TEXT PRIMARY KEY,
                        org_id          TEXT NOT NULL,
                        project_id      TEXT,
                        name            TEXT NOT NULL,
                        cron_expression TEXT NOT NULL,
                        environment     TEXT NOT NULL,
                        is_active       INTEGER NOT NULL DEFAULT 1,
                        image           TEXT NOT NULL,
                        folder          TEXT NOT NULL,
                        base_url        TEXT,
                        created_at      TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_schedules_org ON schedules(org_id);

                    CREATE TABLE IF NOT EXISTS ingest_archive (
                        session_id  TEXT PRIMARY KEY,
                        org_id      TEXT NOT NULL,
                        doc         TEXT NOT NULL,
                        archived_at TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_ingest_archive_age
                        ON ingest_archive(archived_at);
                    ",
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }
}
