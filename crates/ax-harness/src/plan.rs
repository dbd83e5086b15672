//! Per-organization plan quota checks.
//!
//! Every limited create operation goes through [`PlanEnforcer::check`]
//! before touching the store. `RunTest` counts executions inside the
//! current UTC calendar month; the other actions count live rows.

use chrono::{Datelike, TimeZone, Utc};
use serde::Serialize;

use ax_core::types::Organization;
use ax_store::{StoreDb, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitedAction {
    CreateProject,
    RunTest,
    InviteUser,
}

/// Outcome of a quota check, surfaced verbatim in 403 responses.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitCheck {
    pub used: u64,
    pub limit: u64,
    pub exceeded: bool,
}

/// First instant of the current calendar month, UTC.
pub fn current_month_start() -> chrono::DateTime<Utc> {
    let now = Utc::now();
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .expect("first of month is always valid")
}

/// `YYYY-MM` label for the current month.
pub fn current_period() -> String {
    let now = Utc::now();
    format!("{:04}-{:02}", now.year(), now.month())
}

pub struct PlanEnforcer;

impl PlanEnforcer {
    /// Compute `{used, limit, exceeded}` for one action against one org.
    pub async fn check(
        store: &StoreDb,
        org: &Organization,
        action: LimitedAction,
    ) -> Result<LimitCheck, StoreError> {
        let (used, limit) = match action {
            LimitedAction::CreateProject => (
                store.count_projects(&org.id).await?,
                org.limits.max_projects,
            ),
            LimitedAction::RunTest => (
                store
                    .count_runs_since(&org.id, current_month_start())
                    .await?,
                org.limits.max_test_runs,
            ),
            LimitedAction::InviteUser => {
                (store.count_users(&org.id).await?, org.limits.max_users)
            }
        };
        Ok(LimitCheck {
            used,
            limit,
            exceeded: used >= limit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ax_core::types::{Plan, Project, User, UserRole};
    use chrono::Timelike;

    #[tokio::test]
    async fn project_limit_trips_at_ceiling() {
        let store = StoreDb::open_in_memory().await.unwrap();
        let org = Organization::new("Acme", "acme", Plan::Free);
        store.create_organization(&org).await.unwrap();

        for i in 0..org.limits.max_projects {
            let check = PlanEnforcer::check(&store, &org, LimitedAction::CreateProject)
                .await
                .unwrap();
            assert!(!check.exceeded, "project {i} should be admitted");
            let p = Project::new(&org.id, format!("p{i}"), format!("p{i}"));
            store.create_project(&p).await.unwrap();
        }

        let check = PlanEnforcer::check(&store, &org, LimitedAction::CreateProject)
            .await
            .unwrap();
        assert!(check.exceeded);
        assert_eq!(check.used, org.limits.max_projects);
        assert_eq!(check.limit, org.limits.max_projects);
    }

    #[tokio::test]
    async fn user_limit_counts_existing_rows() {
        let store = StoreDb::open_in_memory().await.unwrap();
        let org = Organization::new("Acme", "acme", Plan::Free);
        store.create_organization(&org).await.unwrap();
        for i in 0..3 {
            let u = User::new(
                &org.id,
                format!("u{i}@x.io"),
                format!("U{i}"),
                "h",
                UserRole::Developer,
            );
            store.create_user(&u).await.unwrap();
        }
        let check = PlanEnforcer::check(&store, &org, LimitedAction::InviteUser)
            .await
            .unwrap();
        assert_eq!(check.used, 3);
        assert!(check.exceeded); // free plan allows exactly 3
    }

    #[test]
    fn month_start_is_first_midnight() {
        let start = current_month_start();
        assert_eq!(start.day(), 1);
        assert_eq!(start.hour(), 0);
        assert!(start <= Utc::now());
    }
}
