//! Organizations, users, and API keys.

use chrono::{DateTime, Utc};

use ax_core::types::{ApiKey, Organization, User, UserRole};

use crate::store::{enum_from_sql, enum_to_sql, StoreDb};
use crate::StoreError;

fn org_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Organization> {
    Ok(Organization {
        id: row.get(0)?,
        name: row.get(1)?,
        slug: row.get(2)?,
        plan: enum_from_sql(&row.get::<_, String>(3)?),
        limits: serde_json::from_str(&row.get::<_, String>(4)?).unwrap_or_else(|_| {
            ax_core::types::OrgLimits::for_plan(ax_core::types::Plan::Free)
        }),
        features: serde_json::from_str(&row.get::<_, String>(5)?).unwrap_or_default(),
        created_at: parse_ts(&row.get::<_, String>(6)?),
        updated_at: parse_ts(&row.get::<_, String>(7)?),
    })
}

fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        org_id: row.get(1)?,
        email: row.get(2)?,
        name: row.get(3)?,
        hashed_password: row.get(4)?,
        role: enum_from_sql(&row.get::<_, String>(5)?),
        status: enum_from_sql(&row.get::<_, String>(6)?),
        last_login_at: row.get::<_, Option<String>>(7)?.map(|s| parse_ts(&s)),
        created_at: parse_ts(&row.get::<_, String>(8)?),
    })
}

fn api_key_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ApiKey> {
    Ok(ApiKey {
        id: row.get(0)?,
        org_id: row.get(1)?,
        user_id: row.get(2)?,
        key_hash: row.get(3)?,
        label: row.get(4)?,
        last_used_at: row.get::<_, Option<String>>(5)?.map(|s| parse_ts(&s)),
        created_at: parse_ts(&row.get::<_, String>(6)?),
    })
}

pub(crate) fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}

impl StoreDb {
    // -----------------------------------------------------------------------
    // Organizations
    // -----------------------------------------------------------------------

    pub async fn create_organization(&self, org: &Organization) -> Result<(), StoreError> {
        let org = org.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO organizations
                     (id, name, slug, plan, limits, features, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    rusqlite::params![
                        org.id,
                        org.name,
                        org.slug,
                        enum_to_sql(&org.plan),
                        serde_json::to_string(&org.limits).expect("serialize limits"),
                        serde_json::to_string(&org.features).expect("serialize features"),
                        org.created_at.to_rfc3339(),
                        org.updated_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn get_organization(&self, org_id: &str) -> Result<Organization, StoreError> {
        let org_id = org_id.to_string();
        self.conn
            .call(move |conn| {
                let org = conn.query_row(
                    "SELECT id, name, slug, plan, limits, features, created_at, updated_at
                     FROM organizations WHERE id = ?1",
                    [org_id],
                    org_from_row,
                )?;
                Ok(org)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Plan/limit mutation, driven by the billing collaborator.
    pub async fn update_org_plan(
        &self,
        org_id: &str,
        plan: ax_core::types::Plan,
        limits: ax_core::types::OrgLimits,
    ) -> Result<(), StoreError> {
        let org_id = org_id.to_string();
        let changed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE organizations
                     SET plan = ?1, limits = ?2, updated_at = ?3 WHERE id = ?4",
                    rusqlite::params![
                        enum_to_sql(&plan),
                        serde_json::to_string(&limits).expect("serialize limits"),
                        Utc::now().to_rfc3339(),
                        org_id,
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

    // -----------------------------------------------------------------------
    // Users
    // -----------------------------------------------------------------------

    pub async fn create_user(&self, user: &User) -> Result<(), StoreError> {
        let user = user.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO users
                     (id, org_id, email, name, hashed_password, role, status,
                      last_login_at, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    rusqlite::params![
                        user.id,
                        user.org_id,
                        user.email,
                        user.name,
                        user.hashed_password,
                        enum_to_sql(&user.role),
                        enum_to_sql(&user.status),
                        user.last_login_at.map(|t| t.to_rfc3339()),
                        user.created_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    /// Global lookup — login happens before the org is known.
    pub async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let email = email.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, org_id, email, name, hashed_password, role, status,
                            last_login_at, created_at
                     FROM users WHERE email = ?1",
                )?;
                let mut rows = stmt.query_map([email], user_from_row)?;
                match rows.next() {
                    Some(user) => Ok(Some(user?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn get_user(&self, org_id: &str, user_id: &str) -> Result<User, StoreError> {
        let (org_id, user_id) = (org_id.to_string(), user_id.to_string());
        self.conn
            .call(move |conn| {
                let user = conn.query_row(
                    "SELECT id, org_id, email, name, hashed_password, role, status,
                            last_login_at, created_at
                     FROM users WHERE org_id = ?1 AND id = ?2",
                    [org_id, user_id],
                    user_from_row,
                )?;
                Ok(user)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn count_users(&self, org_id: &str) -> Result<u64, StoreError> {
        let org_id = org_id.to_string();
        self.conn
            .call(move |conn| {
                let n: u64 = conn.query_row(
                    "SELECT COUNT(*) FROM users WHERE org_id = ?1",
                    [org_id],
                    |row| row.get(0),
                )?;
                Ok(n)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn count_admins(&self, org_id: &str) -> Result<u64, StoreError> {
        let org_id = org_id.to_string();
        self.conn
            .call(move |conn| {
                let n: u64 = conn.query_row(
                    "SELECT COUNT(*) FROM users WHERE org_id = ?1 AND role = 'admin'",
                    [org_id],
                    |row| row.get(0),
                )?;
                Ok(n)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn update_user_role(
        &self,
        org_id: &str,
        user_id: &str,
        role: UserRole,
    ) -> Result<(), StoreError> {
        let (org_id, user_id) = (org_id.to_string(), user_id.to_string());
        let changed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE users SET role = ?1 WHERE org_id = ?2 AND id = ?3",
                    rusqlite::params![enum_to_sql(&role), org_id, user_id],
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

    pub async fn update_last_login(&self, user_id: &str) -> Result<(), StoreError> {
        let user_id = user_id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE users SET last_login_at = ?1 WHERE id = ?2",
                    rusqlite::params![Utc::now().to_rfc3339(), user_id],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    // -----------------------------------------------------------------------
    // API keys
    // -----------------------------------------------------------------------

    pub async fn create_api_key(&self, key: &ApiKey) -> Result<(), StoreError> {
        let key = key.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO api_keys
                     (id, org_id, user_id, key_hash, label, last_used_at, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![
                        key.id,
                        key.org_id,
                        key.user_id,
                        key.key_hash,
                        key.label,
                        key.last_used_at.map(|t| t.to_rfc3339()),
                        key.created_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn find_api_key_by_hash(
        &self,
        key_hash: &str,
    ) -> Result<Option<ApiKey>, StoreError> {
        let key_hash = key_hash.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, org_id, user_id, key_hash, label, last_used_at, created_at
                     FROM api_keys WHERE key_hash = ?1",
                )?;
                let mut rows = stmt.query_map([key_hash], api_key_from_row)?;
                match rows.next() {
                    Some(key) => Ok(Some(key?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(StoreError::from)
    }

    /// Best-effort usage stamp; failures are the caller's to ignore.
    pub async fn touch_api_key(&self, key_id: &str) -> Result<(), StoreError> {
        let key_id = key_id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE api_keys SET last_used_at = ?1 WHERE id = ?2",
                    rusqlite::params![Utc::now().to_rfc3339(), key_id],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }
}
