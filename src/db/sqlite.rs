use crate::config::{Config, NamePolicy};
use crate::db::models::{
    ChildKind, ChildRecord, NewChild, NewProject, Project, ProjectPatch, ProjectRef,
};
use crate::error::{CatalogError, constraint_kind};
use chrono::{DateTime, Utc};
use sqlx::error::ErrorKind;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, QueryBuilder, Row, Sqlite};
use std::str::FromStr;
use tracing::debug;

pub type SqlitePool = Pool<Sqlite>;

const PROJECT_COLUMNS: &str =
    "id, git_hash, url, name, description, created_at, modified_at, large_data_id";

/// Open the catalog database. Every connection enforces foreign keys and
/// waits up to `busy_timeout_ms` for locks held by other writers.
pub async fn connect(cfg: &Config) -> Result<SqlitePool, CatalogError> {
    let connect_opts = SqliteConnectOptions::from_str(cfg.database_url.as_str())?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(cfg.busy_timeout());
    let pool = SqlitePoolOptions::new()
        .max_connections(cfg.max_connections.max(1))
        .connect_with(connect_opts)
        .await?;
    Ok(pool)
}

/// Integrity-enforced access to the catalog tables. Uniqueness, the
/// non-empty name check, cascades and timestamps are all enforced by the
/// database; this type maps the resulting failures onto `CatalogError`.
#[derive(Clone)]
pub struct CatalogStorage {
    pool: SqlitePool,
    name_policy: NamePolicy,
}

impl CatalogStorage {
    pub fn new(pool: SqlitePool, name_policy: NamePolicy) -> Self {
        Self { pool, name_policy }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn create_project(&self, new: NewProject) -> Result<Project, CatalogError> {
        self.check_name(&new.name)?;
        let row = sqlx::query(&format!(
            "INSERT INTO project (git_hash, url, name, description, large_data_id)
             VALUES (?, ?, ?, ?, ?)
             RETURNING {PROJECT_COLUMNS}"
        ))
        .bind(new.git_hash)
        .bind(new.url)
        .bind(&new.name)
        .bind(new.description)
        .bind(new.large_data_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| project_write_error(e, &new.name))?;
        let project = Self::row_to_project(row)?;
        debug!(id = project.id, name = %project.name, "project created");
        Ok(project)
    }

    pub async fn get_project(&self, id: i64) -> Result<Project, CatalogError> {
        let row = sqlx::query(&format!("SELECT {PROJECT_COLUMNS} FROM project WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(CatalogError::NotFound { table: "project", id })?;
        Self::row_to_project(row)
    }

    pub async fn find_project_by_name(&self, name: &str) -> Result<Option<Project>, CatalogError> {
        sqlx::query(&format!("SELECT {PROJECT_COLUMNS} FROM project WHERE name = ?"))
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .map(Self::row_to_project)
            .transpose()
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>, CatalogError> {
        let rows = sqlx::query(&format!("SELECT {PROJECT_COLUMNS} FROM project ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Self::row_to_project).collect()
    }

    /// Apply a partial update. `modified_at` is bumped by the database even
    /// when the patch is empty.
    pub async fn update_project(
        &self,
        id: i64,
        patch: ProjectPatch,
    ) -> Result<Project, CatalogError> {
        if let Some(name) = patch.name.as_deref() {
            self.check_name(name)?;
        }
        let name_for_error = patch.name.clone().unwrap_or_default();

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE project SET ");
        let mut sets = qb.separated(", ");
        let mut touched = false;
        if let Some(name) = patch.name {
            sets.push("name = ").push_bind_unseparated(name);
            touched = true;
        }
        if let Some(url) = patch.url {
            sets.push("url = ").push_bind_unseparated(url);
            touched = true;
        }
        if let Some(git_hash) = patch.git_hash {
            sets.push("git_hash = ").push_bind_unseparated(git_hash);
            touched = true;
        }
        if let Some(description) = patch.description {
            sets.push("description = ").push_bind_unseparated(description);
            touched = true;
        }
        if !touched {
            sets.push("name = name");
        }
        qb.push(" WHERE id = ").push_bind(id);

        let mut tx = self.pool.begin().await?;
        let result = qb
            .build()
            .execute(&mut *tx)
            .await
            .map_err(|e| project_write_error(e, &name_for_error))?;
        if result.rows_affected() == 0 {
            return Err(CatalogError::NotFound { table: "project", id });
        }
        let row = sqlx::query(&format!("SELECT {PROJECT_COLUMNS} FROM project WHERE id = ?"))
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Self::row_to_project(row)
    }

    /// Record (or clear) the large object backing a project's files.
    pub async fn set_large_data(
        &self,
        id: i64,
        large_data_id: Option<i64>,
    ) -> Result<Project, CatalogError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("UPDATE project SET large_data_id = ? WHERE id = ?")
            .bind(large_data_id)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CatalogError::NotFound { table: "project", id });
        }
        let row = sqlx::query(&format!("SELECT {PROJECT_COLUMNS} FROM project WHERE id = ?"))
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Self::row_to_project(row)
    }

    /// Delete a project; its inventories, extra vars and playbooks go with
    /// it in the same transaction. Returns how many child rows were removed.
    pub async fn delete_project(&self, id: i64) -> Result<u64, CatalogError> {
        let mut tx = self.pool.begin().await?;
        let mut cascaded = 0u64;
        for kind in ChildKind::ALL {
            let (count,): (i64,) = sqlx::query_as(&format!(
                "SELECT COUNT(*) FROM {} WHERE project_id = ?",
                kind.table()
            ))
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
            cascaded += count as u64;
        }
        let result = sqlx::query("DELETE FROM project WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CatalogError::NotFound { table: "project", id });
        }
        tx.commit().await?;
        debug!(id, cascaded, "project deleted");
        Ok(cascaded)
    }

    pub async fn attach_child(&self, new: NewChild) -> Result<ChildRecord, CatalogError> {
        let table = new.kind.table();
        let row = sqlx::query(&format!(
            "INSERT INTO {table} (name, {body}, project_id) VALUES (?, ?, ?)
             RETURNING id, name, {body} AS body, project_id",
            body = new.kind.body_column()
        ))
        .bind(new.name)
        .bind(new.body)
        .bind(new.project.id())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match constraint_kind(&e) {
            Some(ErrorKind::ForeignKeyViolation) => CatalogError::ForeignKeyViolation {
                table,
                project_id: new.project.id().unwrap_or_default(),
            },
            _ => e.into(),
        })?;
        Self::row_to_child(new.kind, row)
    }

    pub async fn get_child(&self, kind: ChildKind, id: i64) -> Result<ChildRecord, CatalogError> {
        let row = sqlx::query(&format!(
            "SELECT id, name, {body} AS body, project_id FROM {table} WHERE id = ?",
            body = kind.body_column(),
            table = kind.table()
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(CatalogError::NotFound {
            table: kind.table(),
            id,
        })?;
        Self::row_to_child(kind, row)
    }

    /// Children owned by `project`, or the unowned ones for `ProjectRef::Absent`.
    pub async fn list_children(
        &self,
        kind: ChildKind,
        project: ProjectRef,
    ) -> Result<Vec<ChildRecord>, CatalogError> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT id, name, {body} AS body, project_id FROM {table} WHERE project_id ",
            body = kind.body_column(),
            table = kind.table()
        ));
        match project {
            ProjectRef::Absent => qb.push("IS NULL"),
            ProjectRef::Present(id) => qb.push("= ").push_bind(id),
        };
        qb.push(" ORDER BY id");
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|row| Self::row_to_child(kind, row))
            .collect()
    }

    pub async fn delete_child(&self, kind: ChildKind, id: i64) -> Result<(), CatalogError> {
        let result = sqlx::query(&format!("DELETE FROM {} WHERE id = ?", kind.table()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CatalogError::NotFound {
                table: kind.table(),
                id,
            });
        }
        Ok(())
    }

    /// The literal `name != ''` check lives in the table; the trimmed policy
    /// additionally rejects whitespace-only names before they get there.
    fn check_name(&self, name: &str) -> Result<(), CatalogError> {
        match self.name_policy {
            NamePolicy::Trimmed if name.trim().is_empty() => Err(CatalogError::EmptyName),
            _ => Ok(()),
        }
    }

    fn row_to_project(row: SqliteRow) -> Result<Project, CatalogError> {
        let created_at: String = row.try_get("created_at")?;
        let modified_at: String = row.try_get("modified_at")?;
        Ok(Project {
            id: row.try_get("id")?,
            git_hash: row.try_get("git_hash")?,
            url: row.try_get("url")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            created_at: parse_timestamp(&created_at)?,
            modified_at: parse_timestamp(&modified_at)?,
            large_data_id: row.try_get("large_data_id")?,
        })
    }

    fn row_to_child(kind: ChildKind, row: SqliteRow) -> Result<ChildRecord, CatalogError> {
        let project_id: Option<i64> = row.try_get("project_id")?;
        Ok(ChildRecord {
            kind,
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            body: row.try_get("body")?,
            project: project_id.into(),
        })
    }
}

pub(crate) fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, CatalogError> {
    let ts = DateTime::parse_from_rfc3339(s)
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))?
        .with_timezone(&Utc);
    Ok(ts)
}

fn project_write_error(e: sqlx::Error, name: &str) -> CatalogError {
    match constraint_kind(&e) {
        Some(ErrorKind::UniqueViolation) => CatalogError::DuplicateName(name.to_string()),
        Some(ErrorKind::CheckViolation) => CatalogError::EmptyName,
        _ => e.into(),
    }
}
