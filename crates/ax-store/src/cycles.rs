//! Test cycles with embedded items.
//!
//! Items are stored as a JSON column: a cycle owns its items outright, and
//! item mutations go through load-modify-save on the whole row.

use ax_core::types::TestCycle;

use crate::store::{enum_from_sql, enum_to_sql, StoreDb};
use crate::tenants::parse_ts;
use crate::StoreError;

const CYCLE_COLS: &str = "id, org_id, project_id, name, status, items, summary, \
     created_at, updated_at";

fn cycle_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TestCycle> {
    Ok(TestCycle {
        id: row.get(0)?,
        org_id: row.get(1)?,
        project_id: row.get(2)?,
        name: row.get(3)?,
        status: enum_from_sql(&row.get::<_, String>(4)?),
        items: serde_json::from_str(&row.get::<_, String>(5)?).unwrap_or_default(),
        summary: serde_json::from_str(&row.get::<_, String>(6)?).unwrap_or_default(),
        created_at: parse_ts(&row.get::<_, String>(7)?),
        updated_at: parse_ts(&row.get::<_, String>(8)?),
    })
}

impl StoreDb {
    pub async fn create_test_cycle(&self, cycle: &TestCycle) -> Result<(), StoreError> {
        let c = cycle.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO test_cycles
                     (id, org_id, project_id, name, status, items, summary,
                      created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    rusqlite::params![
                        c.id,
                        c.org_id,
                        c.project_id,
                        c.name,
                        enum_to_sql(&c.status),
                        serde_json::to_string(&c.items).expect("serialize items"),
                        serde_json::to_string(&c.summary).expect("serialize summary"),
                        c.created_at.to_rfc3339(),
                        c.updated_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn get_test_cycle(&self, org_id: &str, id: &str) -> Result<TestCycle, StoreError> {
        let (org_id, id) = (org_id.to_string(), id.to_string());
        self.conn
            .call(move |conn| {
                let cycle = conn.query_row(
                    &format!(
                        "SELECT {CYCLE_COLS} FROM test_cycles WHERE org_id = ?1 AND id = ?2"
                    ),
                    [org_id, id],
                    cycle_from_row,
                )?;
                Ok(cycle)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn list_test_cycles(&self, org_id: &str) -> Result<Vec<TestCycle>, StoreError> {
        let org_id = org_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {CYCLE_COLS} FROM test_cycles
                     WHERE org_id = ?1 ORDER BY created_at DESC"
                ))?;
                let rows = stmt.query_map([org_id], cycle_from_row)?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Persist a mutated cycle (status, items, summary) scoped by org.
    pub async fn save_test_cycle(&self, cycle: &TestCycle) -> Result<(), StoreError> {
        let c = cycle.clone();
        let changed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE test_cycles
                     SET name = ?1, status = ?2, items = ?3, summary = ?4, updated_at = ?5
                     WHERE org_id = ?6 AND id = ?7",
                    rusqlite::params![
                        c.name,
                        enum_to_sql(&c.status),
                        serde_json::to_string(&c.items).expect("serialize items"),
                        serde_json::to_string(&c.summary).expect("serialize summary"),
                        chrono::Utc::now().to_rfc3339(),
                        c.org_id,
                        c.id,
                    ],
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use ax_core::types::{
        CycleItem, CycleItemType, CycleStatus, CycleSummary, Organization, Plan,
    };
    use chrono::Utc;
    use uuid::Uuid;

    fn cycle(org_id: &str) -> TestCycle {
        let now = Utc::now();
        TestCycle {
            id: Uuid::new_v4().to_string(),
            org_id: org_id.into(),
            project_id: "p1".into(),
            name: "Release 1.2".into(),
            status: CycleStatus::Running,
            items: vec![CycleItem {
                id: Uuid::new_v4().to_string(),
                test_case_id: None,
                item_type: CycleItemType::Automated,
                title: "smoke".into(),
                status: "RUNNING".into(),
                execution_id: Some("t1".into()),
                manual_steps: None,
            }],
            summary: CycleSummary::default(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn cycle_round_trip_with_items() {
        let db = StoreDb::open_in_memory().await.unwrap();
        db.create_organization(&Organization::new("A", "a", Plan::Free))
            .await
            .unwrap();
        let c = cycle("org-a");
        db.create_test_cycle(&c).await.unwrap();

        let loaded = db.get_test_cycle("org-a", &c.id).await.unwrap();
        assert_eq!(loaded.items.len(), 1);
        assert_eq!(loaded.items[0].execution_id.as_deref(), Some("t1"));
        assert_eq!(loaded.status, CycleStatus::Running);
    }

    #[tokio::test]
    async fn save_updates_items_and_summary() {
        let db = StoreDb::open_in_memory().await.unwrap();
        let mut c = cycle("org-a");
        db.create_test_cycle(&c).await.unwrap();

        c.status = CycleStatus::Completed;
        c.items[0].status = "PASSED".into();
        c.summary = CycleSummary {
            total: 1,
            passed: 1,
            failed: 0,
            automation_rate: 100.0,
        };
        db.save_test_cycle(&c).await.unwrap();

        let loaded = db.get_test_cycle("org-a", &c.id).await.unwrap();
        assert_eq!(loaded.status, CycleStatus::Completed);
        assert_eq!(loaded.items[0].status, "PASSED");
        assert_eq!(loaded.summary.passed, 1);
    }

    #[tokio::test]
    async fn save_is_org_scoped() {
        let db = StoreDb::open_in_memory().await.unwrap();
        let mut c = cycle("org-a");
        db.create_test_cycle(&c).await.unwrap();
        c.org_id = "org-b".into();
        assert!(matches!(
            db.save_test_cycle(&c).await,
            Err(StoreError::NotFound)
        ));
    }
}
