//! Projects and their environment variables.

use chrono::Utc;

use ax_core::types::{Project, ProjectEnvVar};

use crate::store::StoreDb;
use crate::tenants::parse_ts;
use crate::StoreError;

fn project_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        org_id: row.get(1)?,
        name: row.get(2)?,
        slug: row.get(3)?,
        created_at: parse_ts(&row.get::<_, String>(4)?),
        updated_at: parse_ts(&row.get::<_, String>(5)?),
    })
}

fn env_var_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProjectEnvVar> {
    Ok(ProjectEnvVar {
        id: row.get(0)?,
        org_id: row.get(1)?,
        project_id: row.get(2)?,
        key: row.get(3)?,
        value: row.get(4)?,
        encrypted: row
            .get::<_, Option<String>>(5)?
            .and_then(|raw| serde_json::from_str(&raw).ok()),
        is_secret: row.get::<_, i64>(6)? != 0,
        created_at: parse_ts(&row.get::<_, String>(7)?),
        updated_at: parse_ts(&row.get::<_, String>(8)?),
    })
}

const PROJECT_COLS: &str = "id, org_id, name, slug, created_at, updated_at";
const ENV_VAR_COLS: &str =
    "id, org_id, project_id, key, value, encrypted, is_secret, created_at, updated_at";

impl StoreDb {
    // -----------------------------------------------------------------------
    // Projects
    // -----------------------------------------------------------------------

    pub async fn create_project(&self, project: &Project) -> Result<(), StoreError> {
        let p = project.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO projects (id, org_id, name, slug, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params![
                        p.id,
                        p.org_id,
                        p.name,
                        p.slug,
                        p.created_at.to_rfc3339(),
                        p.updated_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn get_project(&self, org_id: &str, id: &str) -> Result<Project, StoreError> {
        let (org_id, id) = (org_id.to_string(), id.to_string());
        self.conn
            .call(move |conn| {
                let project = conn.query_row(
                    &format!("SELECT {PROJECT_COLS} FROM projects WHERE org_id = ?1 AND id = ?2"),
                    [org_id, id],
                    project_from_row,
                )?;
                Ok(project)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn list_projects(&self, org_id: &str) -> Result<Vec<Project>, StoreError> {
        let org_id = org_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {PROJECT_COLS} FROM projects WHERE org_id = ?1 ORDER BY created_at"
                ))?;
                let rows = stmt.query_map([org_id], project_from_row)?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn count_projects(&self, org_id: &str) -> Result<u64, StoreError> {
        let org_id = org_id.to_string();
        self.conn
            .call(move |conn| {
                let n: u64 = conn.query_row(
                    "SELECT COUNT(*) FROM projects WHERE org_id = ?1",
                    [org_id],
                    |row| row.get(0),
                )?;
                Ok(n)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn update_project_name(
        &self,
        org_id: &str,
        id: &str,
        name: &str,
    ) -> Result<(), StoreError> {
        let (org_id, id, name) = (org_id.to_string(), id.to_string(), name.to_string());
        let changed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE projects SET name = ?1, updated_at = ?2
                     WHERE org_id = ?3 AND id = ?4",
                    rusqlite::params![name, Utc::now().to_rfc3339(), org_id, id],
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

    pub async fn delete_project(&self, org_id: &str, id: &str) -> Result<(), StoreError> {
        let (org_id, id) = (org_id.to_string(), id.to_string());
        let changed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "DELETE FROM projects WHERE org_id = ?1 AND id = ?2",
                    [&org_id, &id],
                )?;
                conn.execute(
                    "DELETE FROM project_env_vars WHERE org_id = ?1 AND project_id = ?2",
                    [&org_id, &id],
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
    // Env vars
    // -----------------------------------------------------------------------

    pub async fn create_env_var(&self, var: &ProjectEnvVar) -> Result<(), StoreError> {
        let v = var.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO project_env_vars
                     (id, org_id, project_id, key, value, encrypted, is_secret,
                      created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    rusqlite::params![
                        v.id,
                        v.org_id,
                        v.project_id,
                        v.key,
                        v.value,
                        v.encrypted
                            .as_ref()
                            .map(|e| serde_json::to_string(e).expect("serialize envelope")),
                        v.is_secret as i64,
                        v.created_at.to_rfc3339(),
                        v.updated_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn list_env_vars(
        &self,
        org_id: &str,
        project_id: &str,
    ) -> Result<Vec<ProjectEnvVar>, StoreError> {
        let (org_id, project_id) = (org_id.to_string(), project_id.to_string());
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {ENV_VAR_COLS} FROM project_env_vars
                     WHERE org_id = ?1 AND project_id = ?2 ORDER BY key"
                ))?;
                let rows = stmt.query_map([org_id, project_id], env_var_from_row)?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn count_env_vars(
        &self,
        org_id: &str,
        project_id: &str,
    ) -> Result<u64, StoreError> {
        let (org_id, project_id) = (org_id.to_string(), project_id.to_string());
        self.conn
            .call(move |conn| {
                let n: u64 = conn.query_row(
                    "SELECT COUNT(*) FROM project_env_vars
                     WHERE org_id = ?1 AND project_id = ?2",
                    [org_id, project_id],
                    |row| row.get(0),
                )?;
                Ok(n)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn update_env_var(&self, var: &ProjectEnvVar) -> Result<(), StoreError> {
        let v = var.clone();
        let changed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE project_env_vars
                     SET value = ?1, encrypted = ?2, is_secret = ?3, updated_at = ?4
                     WHERE org_id = ?5 AND id = ?6",
                    rusqlite::params![
                        v.value,
                        v.encrypted
                            .as_ref()
                            .map(|e| serde_json::to_string(e).expect("serialize envelope")),
                        v.is_secret as i64,
                        Utc::now().to_rfc3339(),
                        v.org_id,
                        v.id,
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

    pub async fn get_env_var(
        &self,
        org_id: &str,
        var_id: &str,
    ) -> Result<ProjectEnvVar, StoreError> {
        let (org_id, var_id) = (org_id.to_string(), var_id.to_string());
        self.conn
            .call(move |conn| {
                let var = conn.query_row(
                    &format!(
                        "SELECT {ENV_VAR_COLS} FROM project_env_vars
                         WHERE org_id = ?1 AND id = ?2"
                    ),
                    [org_id, var_id],
                    env_var_from_row,
                )?;
                Ok(var)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn delete_env_var(&self, org_id: &str, var_id: &str) -> Result<(), StoreError> {
        let (org_id, var_id) = (org_id.to_string(), var_id.to_string());
        let changed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "DELETE FROM project_env_vars WHERE org_id = ?1 AND id = ?2",
                    [org_id, var_id],
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
    use ax_core::types::{EncryptedPayload, Organization, Plan};
    use uuid::Uuid;

    async fn fixture() -> (StoreDb, Organization, Project) {
        let db = StoreDb::open_in_memory().await.unwrap();
        let org = Organization::new("Acme", "acme", Plan::Team);
        db.create_organization(&org).await.unwrap();
        let project = Project::new(&org.id, "Checkout", "checkout");
        db.create_project(&project).await.unwrap();
        (db, org, project)
    }

    fn plain_var(org: &str, project: &str, key: &str, value: &str) -> ProjectEnvVar {
        let now = Utc::now();
        ProjectEnvVar {
            id: Uuid::new_v4().to_string(),
            org_id: org.into(),
            project_id: project.into(),
            key: key.into(),
            value: Some(value.into()),
            encrypted: None,
            is_secret: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn project_slug_unique_per_org() {
        let (db, org, _p) = fixture().await;
        let dup = Project::new(&org.id, "Checkout 2", "checkout");
        assert!(matches!(
            db.create_project(&dup).await,
            Err(StoreError::Conflict(_))
        ));

        // The same slug is fine in another org.
        let other = Organization::new("Beta", "beta", Plan::Free);
        db.create_organization(&other).await.unwrap();
        let ok = Project::new(&other.id, "Checkout", "checkout");
        db.create_project(&ok).await.unwrap();
    }

    #[tokio::test]
    async fn cross_tenant_project_lookup_misses() {
        let (db, _org, project) = fixture().await;
        assert!(matches!(
            db.get_project("other-org", &project.id).await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn env_var_key_unique_per_project() {
        let (db, org, project) = fixture().await;
        db.create_env_var(&plain_var(&org.id, &project.id, "BASE_URL", "http://a"))
            .await
            .unwrap();
        assert!(matches!(
            db.create_env_var(&plain_var(&org.id, &project.id, "BASE_URL", "http://b"))
                .await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn encrypted_envelope_round_trips() {
        let (db, org, project) = fixture().await;
        let mut var = plain_var(&org.id, &project.id, "API_TOKEN", "");
        var.value = None;
        var.is_secret = true;
        var.encrypted = Some(EncryptedPayload {
            iv: "aXY=".into(),
            ciphertext: "Y3Q=".into(),
            tag: "dGFn".into(),
        });
        db.create_env_var(&var).await.unwrap();

        let vars = db.list_env_vars(&org.id, &project.id).await.unwrap();
        assert_eq!(vars.len(), 1);
        assert!(vars[0].is_secret);
        assert_eq!(vars[0].encrypted.as_ref().unwrap().iv, "aXY=");
        assert!(vars[0].value.is_none());
    }

    #[tokio::test]
    async fn delete_project_removes_env_vars() {
        let (db, org, project) = fixture().await;
        db.create_env_var(&plain_var(&org.id, &project.id, "A", "1"))
            .await
            .unwrap();
        db.delete_project(&org.id, &project.id).await.unwrap();
        assert_eq!(db.count_env_vars(&org.id, &project.id).await.unwrap(), 0);
    }
}
