//! Schedules and the ingest-session archive.

use chrono::{Duration, Utc};

use ax_core::types::{IngestSession, Schedule};

use crate::store::{enum_from_sql, enum_to_sql, StoreDb};
use crate::tenants::parse_ts;
use crate::StoreError;

/// Archived ingest sessions are purged after this many days.
pub const INGEST_ARCHIVE_TTL_DAYS: i64 = 7;

const SCHEDULE_COLS: &str = "id, org_id, project_id, name, cron_expression, environment, \
     is_active, image, folder, base_url, created_at";

fn schedule_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Schedule> {
    Ok(Schedule {
        id: row.get(0)?,
        org_id: row.get(1)?,
        project_id: row.get(2)?,
        name: row.get(3)?,
        cron_expression: row.get(4)?,
        environment: enum_from_sql(&row.get::<_, String>(5)?),
        is_active: row.get::<_, i64>(6)? != 0,
        image: row.get(7)?,
        folder: row.get(8)?,
        base_url: row.get(9)?,
        created_at: parse_ts(&row.get::<_, String>(10)?),
    })
}

impl StoreDb {
    // -----------------------------------------------------------------------
    // Schedules
    // -----------------------------------------------------------------------

    pub async fn create_schedule(&self, schedule: &Schedule) -> Result<(), StoreError> {
        let s = schedule.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO schedules
                     (id, org_id, project_id, name, cron_expression, environment,
                      is_active, image, folder, base_url, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    rusqlite::params![
                        s.id,
                        s.org_id,
                        s.project_id,
                        s.name,
                        s.cron_expression,
                        enum_to_sql(&s.environment),
                        s.is_active as i64,
                        s.image,
                        s.folder,
                        s.base_url,
                        s.created_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn list_schedules(&self, org_id: &str) -> Result<Vec<Schedule>, StoreError> {
        let org_id = org_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SCHEDULE_COLS} FROM schedules
                     WHERE org_id = ?1 ORDER BY created_at"
                ))?;
                let rows = stmt.query_map([org_id], schedule_from_row)?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    /// All active schedules across every org (scheduler bootstrap).
    pub async fn list_active_schedules(&self) -> Result<Vec<Schedule>, StoreError> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SCHEDULE_COLS} FROM schedules WHERE is_active = 1"
                ))?;
                let rows = stmt.query_map([], schedule_from_row)?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn delete_schedule(&self, org_id: &str, id: &str) -> Result<(), StoreError> {
        let (org_id, id) = (org_id.to_string(), id.to_string());
        let changed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "DELETE FROM schedules WHERE org_id = ?1 AND id = ?2",
                    [org_id, id],
                )?;
                Ok(n)
            })
            .await
            .map_err(StoreError::from)?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Ingest archive
    // -----------------------------------------------------------------------

    pub async fn archive_ingest_session(
        &self,
        session: &IngestSession,
    ) -> Result<(), StoreError> {
        let s = session.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO ingest_archive
                     (session_id, org_id, doc, archived_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![
                        s.session_id,
                        s.org_id,
                        serde_json::to_string(&s).expect("serialize session"),
                        Utc::now().to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn get_archived_ingest_session(
        &self,
        org_id: &str,
        session_id: &str,
    ) -> Result<IngestSession, StoreError> {
        let (org_id, session_id) = (org_id.to_string(), session_id.to_string());
        self.conn
            .call(move |conn| {
                let doc: String = conn.query_row(
                    "SELECT doc FROM ingest_archive WHERE org_id = ?1 AND session_id = ?2",
                    [org_id, session_id],
                    |row| row.get(0),
                )?;
                Ok(doc)
            })
            .await
            .map_err(StoreError::from)
            .and_then(|doc| serde_json::from_str(&doc).map_err(StoreError::from))
    }

    /// Delete archive rows older than [`INGEST_ARCHIVE_TTL_DAYS`]; returns
    /// the number removed.
    pub async fn purge_ingest_archive(&self) -> Result<usize, StoreError> {
        let cutoff = (Utc::now() - Duration::days(INGEST_ARCHIVE_TTL_DAYS)).to_rfc3339();
        self.conn
            .call(move |conn| {
                let n = conn.execute(
                    "DELETE FROM ingest_archive WHERE archived_at < ?1",
                    [cutoff],
                )?;
                Ok(n)
            })
            .await
            .map_err(StoreError::from)
    }

    #[cfg(test)]
    async fn backdate_archive(&self, session_id: &str, to: chrono::DateTime<Utc>) {
        let session_id = session_id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE ingest_archive SET archived_at = ?1 WHERE session_id = ?2",
                    rusqlite::params![to.to_rfc3339(), session_id],
                )?;
                Ok(())
            })
            .await
            .unwrap();
    }
}
