//! Versioned, idempotent schema migrations.
//!
//! Each migration runs inside `BEGIN IMMEDIATE`, which takes SQLite's
//! write lock for the whole step and serializes concurrent migrators. The
//! `schema_migrations` ledger is written in the same transaction as the
//! DDL, so a step is either fully applied and recorded or not at all.

use crate::db::schema::{
    ColumnDef, Schema, TableDef, TriggerDef, catalog_schema, dependency_order,
};
use crate::db::sqlite::{SqlitePool, parse_timestamp};
use crate::error::CatalogError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqliteConnection;
use sqlx::pool::PoolConnection;
use sqlx::{Row, Sqlite};
use tracing::{debug, info, warn};

pub const LEDGER_TABLE: &str = "schema_migrations";

const LEDGER_INIT: &str = r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    id TEXT PRIMARY KEY,
    description TEXT NOT NULL,
    applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
)
"#;

#[derive(Debug, Clone)]
pub enum MigrationStep {
    CreateTable(TableDef),
    DropTable(&'static str),
    AddColumn {
        table: &'static str,
        column: ColumnDef,
    },
    /// Narrow `column` to NOT NULL. `table` is the full target definition,
    /// used to rebuild the table since SQLite cannot alter columns in place.
    SetNotNull {
        table: TableDef,
        column: &'static str,
    },
    CreateTrigger(TriggerDef),
}

#[derive(Debug, Clone)]
pub struct Migration {
    pub id: &'static str,
    pub description: &'static str,
    pub steps: Vec<MigrationStep>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct MigrationReport {
    pub applied: Vec<String>,
    pub skipped: Vec<String>,
    /// DDL statements executed across all applied migrations.
    pub statements: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AppliedMigration {
    pub id: String,
    pub description: String,
    pub applied_at: DateTime<Utc>,
}

/// Ordered migrations that build the catalog schema from scratch.
pub fn catalog_migrations() -> Vec<Migration> {
    let schema = catalog_schema();
    vec![
        Migration {
            id: "0001_create_catalog_tables",
            description: "project, inventory, extra_var and playbook tables",
            steps: schema
                .tables
                .iter()
                .cloned()
                .map(MigrationStep::CreateTable)
                .collect(),
        },
        Migration {
            id: "0002_project_timestamp_triggers",
            description: "maintain project.modified_at and freeze project.created_at",
            steps: schema
                .triggers
                .iter()
                .cloned()
                .map(MigrationStep::CreateTrigger)
                .collect(),
        },
    ]
}

pub struct Migrator {
    pool: SqlitePool,
}

impl Migrator {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Apply every migration not yet in the ledger, in the given order.
    /// Stops at the first failing migration; earlier ones stay applied.
    pub async fn run(&self, migrations: &[Migration]) -> Result<MigrationReport, CatalogError> {
        let mut conn = self.pool.acquire().await?;
        let recorded = recorded_ids(&mut conn).await?;
        let mut report = MigrationReport::default();

        for migration in migrations {
            if recorded.iter().any(|id| id == migration.id) {
                report.skipped.push(migration.id.to_string());
                continue;
            }
            match self.apply_one(&mut conn, migration).await? {
                Some(statements) => {
                    info!(
                        migration = migration.id,
                        statements, "migration applied"
                    );
                    report.statements += statements;
                    report.applied.push(migration.id.to_string());
                }
                None => {
                    debug!(migration = migration.id, "applied concurrently; skipping");
                    report.skipped.push(migration.id.to_string());
                }
            }
        }
        Ok(report)
    }

    /// Ledger contents in application order.
    pub async fn applied(&self) -> Result<Vec<AppliedMigration>, CatalogError> {
        let mut conn = self.pool.acquire().await?;
        if !object_exists(&mut conn, "table", LEDGER_TABLE).await? {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            "SELECT id, description, applied_at FROM schema_migrations ORDER BY applied_at, id",
        )
        .fetch_all(&mut *conn)
        .await?;
        rows.into_iter()
            .map(|row| {
                let applied_at: String = row.try_get("applied_at")?;
                Ok(AppliedMigration {
                    id: row.try_get("id")?,
                    description: row.try_get("description")?,
                    applied_at: parse_timestamp(&applied_at)?,
                })
            })
            .collect()
    }

    /// Drop every table of `schema` (children first) and clear the ledger,
    /// as one atomic step. Returns the number of DDL statements executed.
    pub async fn teardown(&self, schema: &Schema) -> Result<usize, CatalogError> {
        let order: Vec<&'static str> = schema.drop_order()?.iter().map(|t| t.name).collect();
        let mut conn = self.pool.acquire().await?;
        lock(&mut conn).await?;
        let outcome = drop_tables(&mut conn, &order).await;
        finish(&mut conn, outcome).await
    }

    /// `Ok(None)` when another migrator recorded the id while we waited for
    /// the lock.
    async fn apply_one(
        &self,
        conn: &mut PoolConnection<Sqlite>,
        migration: &Migration,
    ) -> Result<Option<usize>, CatalogError> {
        lock(conn).await?;
        let outcome = apply_locked(conn, migration).await;
        finish(conn, outcome).await
    }
}

async fn apply_locked(
    conn: &mut SqliteConnection,
    migration: &Migration,
) -> Result<Option<usize>, CatalogError> {
    exec(conn, LEDGER_INIT).await?;
    let (already,): (bool,) =
        sqlx::query_as("SELECT EXISTS(SELECT 1 FROM schema_migrations WHERE id = ?)")
            .bind(migration.id)
            .fetch_one(&mut *conn)
            .await?;
    if already {
        return Ok(None);
    }

    let mut statements = 0;
    for step in ordered_steps(conn, &migration.steps).await? {
        statements += apply_step(conn, step).await?;
    }
    sqlx::query("INSERT INTO schema_migrations (id, description) VALUES (?, ?)")
        .bind(migration.id)
        .bind(migration.description)
        .execute(&mut *conn)
        .await?;
    Ok(Some(statements))
}

async fn drop_tables(conn: &mut SqliteConnection, order: &[&str]) -> Result<usize, CatalogError> {
    let mut statements = 0;
    for table in order {
        if object_exists(conn, "table", table).await? {
            exec(conn, &format!("DROP TABLE {table}")).await?;
            statements += 1;
        }
    }
    if object_exists(conn, "table", LEDGER_TABLE).await? {
        sqlx::query("DELETE FROM schema_migrations")
            .execute(&mut *conn)
            .await?;
    }
    Ok(statements)
}

/// Ids already in the ledger; empty if the ledger does not exist yet.
async fn recorded_ids(conn: &mut SqliteConnection) -> Result<Vec<String>, CatalogError> {
    if !object_exists(conn, "table", LEDGER_TABLE).await? {
        return Ok(Vec::new());
    }
    let rows: Vec<(String,)> = sqlx::query_as("SELECT id FROM schema_migrations")
        .fetch_all(&mut *conn)
        .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

async fn lock(conn: &mut SqliteConnection) -> Result<(), CatalogError> {
    match sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await {
        Ok(_) => Ok(()),
        Err(e) => match CatalogError::from(e) {
            CatalogError::Busy(_) => Err(CatalogError::MigrationLockTimeout),
            other => Err(other),
        },
    }
}

/// Commit on success, roll back on failure. A connection that cannot roll
/// back is not returned to the pool.
async fn finish<T>(
    conn: &mut PoolConnection<Sqlite>,
    outcome: Result<T, CatalogError>,
) -> Result<T, CatalogError> {
    match outcome {
        Ok(value) => match sqlx::query("COMMIT").execute(&mut **conn).await {
            Ok(_) => Ok(value),
            Err(e) => {
                rollback(conn).await;
                Err(e.into())
            }
        },
        Err(e) => {
            rollback(conn).await;
            Err(e)
        }
    }
}

async fn rollback(conn: &mut PoolConnection<Sqlite>) {
    if let Err(e) = sqlx::query("ROLLBACK").execute(&mut **conn).await {
        warn!(error = %e, "rollback failed; discarding connection");
        conn.close_on_drop();
    }
}

async fn exec(conn: &mut SqliteConnection, sql: &str) -> Result<(), CatalogError> {
    debug!(sql, "executing DDL");
    sqlx::query(sql).execute(&mut *conn).await?;
    Ok(())
}

async fn object_exists(
    conn: &mut SqliteConnection,
    kind: &str,
    name: &str,
) -> Result<bool, CatalogError> {
    let (exists,): (bool,) =
        sqlx::query_as("SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = ? AND name = ?)")
            .bind(kind)
            .bind(name)
            .fetch_one(&mut *conn)
            .await?;
    Ok(exists)
}

struct LiveColumn {
    name: String,
    not_null: bool,
}

async fn live_columns(
    conn: &mut SqliteConnection,
    table: &str,
) -> Result<Vec<LiveColumn>, CatalogError> {
    let rows = sqlx::query(r#"SELECT name, "notnull" FROM pragma_table_info(?)"#)
        .bind(table)
        .fetch_all(&mut *conn)
        .await?;
    rows.into_iter()
        .map(|row| {
            let not_null: i64 = row.try_get("notnull")?;
            Ok(LiveColumn {
                name: row.try_get("name")?,
                not_null: not_null != 0,
            })
        })
        .collect()
}

/// Tables referenced by `table`'s foreign keys in the live database.
async fn live_parents(
    conn: &mut SqliteConnection,
    table: &str,
) -> Result<Vec<String>, CatalogError> {
    let rows: Vec<(String,)> =
        sqlx::query_as(r#"SELECT DISTINCT "table" FROM pragma_foreign_key_list(?)"#)
            .bind(table)
            .fetch_all(&mut *conn)
            .await?;
    Ok(rows.into_iter().map(|(t,)| t).collect())
}

/// Other tables whose foreign keys point at `table`.
async fn live_dependants(
    conn: &mut SqliteConnection,
    table: &str,
) -> Result<Vec<String>, CatalogError> {
    let rows: Vec<(String,)> = sqlx::query_as(
        r#"SELECT DISTINCT m.name FROM sqlite_master AS m
           JOIN pragma_foreign_key_list(m.name) AS f
           WHERE m.type = 'table' AND f."table" = ? AND m.name != ?"#,
    )
    .bind(table)
    .bind(table)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.into_iter().map(|(t,)| t).collect())
}

/// Creates are reordered parents-first and drops children-first, each
/// within the slots they already occupy; other steps keep their position.
async fn ordered_steps<'a>(
    conn: &mut SqliteConnection,
    steps: &'a [MigrationStep],
) -> Result<Vec<&'a MigrationStep>, CatalogError> {
    let mut ordered: Vec<&MigrationStep> = steps.iter().collect();

    let create_slots: Vec<usize> = steps
        .iter()
        .enumerate()
        .filter(|(_, s)| matches!(s, MigrationStep::CreateTable(_)))
        .map(|(i, _)| i)
        .collect();
    let nodes = create_slots
        .iter()
        .filter_map(|&i| match &steps[i] {
            MigrationStep::CreateTable(t) => {
                Some((t.name.to_string(), t.parents().map(str::to_string).collect()))
            }
            _ => None,
        })
        .collect();
    let create_order = dependency_order(nodes)?;
    for (slot, name) in create_slots.iter().zip(&create_order) {
        if let Some(step) = steps
            .iter()
            .find(|s| matches!(s, MigrationStep::CreateTable(t) if t.name == name.as_str()))
        {
            ordered[*slot] = step;
        }
    }

    let drop_slots: Vec<usize> = steps
        .iter()
        .enumerate()
        .filter(|(_, s)| matches!(s, MigrationStep::DropTable(_)))
        .map(|(i, _)| i)
        .collect();
    let mut nodes = Vec::with_capacity(drop_slots.len());
    for &i in &drop_slots {
        if let MigrationStep::DropTable(name) = &steps[i] {
            nodes.push((name.to_string(), live_parents(conn, name).await?));
        }
    }
    let mut drop_order = dependency_order(nodes)?;
    drop_order.reverse();
    for (slot, name) in drop_slots.iter().zip(&drop_order) {
        if let Some(step) = steps
            .iter()
            .find(|s| matches!(s, MigrationStep::DropTable(t) if *t == name.as_str()))
        {
            ordered[*slot] = step;
        }
    }

    Ok(ordered)
}

/// Diff one step against the live schema and execute whatever DDL closes
/// the gap. Returns the number of statements executed.
async fn apply_step(
    conn: &mut SqliteConnection,
    step: &MigrationStep,
) -> Result<usize, CatalogError> {
    match step {
        MigrationStep::CreateTable(table) => {
            if !object_exists(conn, "table", table.name).await? {
                exec(conn, &table.create_sql()).await?;
                return Ok(1);
            }
            let live = live_columns(conn, table.name).await?;
            let mut statements = 0;
            for column in &table.columns {
                if !live.iter().any(|c| c.name == column.name) {
                    statements += add_column(conn, table.name, column).await?;
                }
            }
            Ok(statements)
        }
        MigrationStep::DropTable(name) => {
            if !object_exists(conn, "table", name).await? {
                return Ok(0);
            }
            exec(conn, &format!("DROP TABLE {name}")).await?;
            Ok(1)
        }
        MigrationStep::AddColumn { table, column } => {
            let live = live_columns(conn, table).await?;
            if live.is_empty() {
                return Err(conflict(table, column.name, "table does not exist"));
            }
            if live.iter().any(|c| c.name == column.name) {
                return Ok(0);
            }
            add_column(conn, table, column).await
        }
        MigrationStep::SetNotNull { table, column } => set_not_null(conn, table, column).await,
        MigrationStep::CreateTrigger(trigger) => {
            if object_exists(conn, "trigger", trigger.name).await? {
                return Ok(0);
            }
            exec(conn, &trigger.create_sql()).await?;
            Ok(1)
        }
    }
}

async fn add_column(
    conn: &mut SqliteConnection,
    table: &str,
    column: &ColumnDef,
) -> Result<usize, CatalogError> {
    if let Some(reason) = column.add_column_obstacle() {
        return Err(conflict(table, column.name, reason));
    }
    exec(
        conn,
        &format!("ALTER TABLE {table} ADD COLUMN {}", column.definition_sql()),
    )
    .await?;
    Ok(1)
}

async fn set_not_null(
    conn: &mut SqliteConnection,
    table: &TableDef,
    column: &str,
) -> Result<usize, CatalogError> {
    let live = live_columns(conn, table.name).await?;
    let Some(current) = live.iter().find(|c| c.name == column) else {
        return Err(conflict(table.name, column, "column does not exist"));
    };
    if current.not_null {
        return Ok(0);
    }
    if table.column(column).is_none_or(|c| c.nullable) {
        return Err(conflict(table.name, column, "target definition still allows NULL"));
    }

    let (has_nulls,): (bool,) = sqlx::query_as(&format!(
        "SELECT EXISTS(SELECT 1 FROM {} WHERE {column} IS NULL)",
        table.name
    ))
    .fetch_one(&mut *conn)
    .await?;
    if has_nulls {
        return Err(conflict(table.name, column, "existing rows hold NULL"));
    }
    if !live_dependants(conn, table.name).await?.is_empty() {
        return Err(conflict(
            table.name,
            column,
            "table is referenced by foreign keys and cannot be rebuilt",
        ));
    }

    // Dropping the old table takes its triggers, indexes and sequence row
    // with it; capture them so the rebuilt table keeps them.
    let attached: Vec<(String,)> = sqlx::query_as(
        "SELECT sql FROM sqlite_master
         WHERE tbl_name = ? AND type IN ('index', 'trigger') AND sql IS NOT NULL
         ORDER BY type, name",
    )
    .bind(table.name)
    .fetch_all(&mut *conn)
    .await?;
    let sequence = sequence_value(conn, table.name).await?;

    // Copy the columns both shapes share into a fresh table, then swap.
    let shared = table
        .columns
        .iter()
        .filter(|c| live.iter().any(|l| l.name == c.name))
        .map(|c| c.name)
        .collect::<Vec<_>>()
        .join(", ");
    let staging = format!("{}__rebuild", table.name);
    exec(conn, &table.create_sql_as(&staging)).await?;
    exec(
        conn,
        &format!(
            "INSERT INTO {staging} ({shared}) SELECT {shared} FROM {}",
            table.name
        ),
    )
    .await?;
    exec(conn, &format!("DROP TABLE {}", table.name)).await?;
    exec(conn, &format!("ALTER TABLE {staging} RENAME TO {}", table.name)).await?;
    for (sql,) in &attached {
        exec(conn, sql).await?;
    }
    if let Some(seq) = sequence {
        restore_sequence(conn, table.name, seq).await?;
    }
    Ok(4 + attached.len())
}

/// AUTOINCREMENT high-water mark for `table`, if it has handed out ids.
async fn sequence_value(
    conn: &mut SqliteConnection,
    table: &str,
) -> Result<Option<i64>, CatalogError> {
    if !object_exists(conn, "table", "sqlite_sequence").await? {
        return Ok(None);
    }
    let seq: Option<(i64,)> = sqlx::query_as("SELECT seq FROM sqlite_sequence WHERE name = ?")
        .bind(table)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(seq.map(|(seq,)| seq))
}

/// Raise `table`'s sequence back to `seq` so deleted ids are never reissued.
async fn restore_sequence(
    conn: &mut SqliteConnection,
    table: &str,
    seq: i64,
) -> Result<(), CatalogError> {
    let updated = sqlx::query("UPDATE sqlite_sequence SET seq = MAX(seq, ?) WHERE name = ?")
        .bind(seq)
        .bind(table)
        .execute(&mut *conn)
        .await?;
    if updated.rows_affected() == 0 {
        sqlx::query("INSERT INTO sqlite_sequence (name, seq) VALUES (?, ?)")
            .bind(table)
            .bind(seq)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

fn conflict(table: &str, column: &str, reason: &str) -> CatalogError {
    CatalogError::SchemaConflict {
        table: table.to_string(),
        column: column.to_string(),
        reason: reason.to_string(),
    }
}
