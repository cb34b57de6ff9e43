//! Declarative description of the catalog tables and their SQLite DDL.
//!
//! The definitions here are inert data: the migrator decides when and in
//! which order they reach the database.

use crate::error::CatalogError;
use std::collections::{BTreeSet, HashMap};

/// Bumped whenever `catalog_schema()` changes shape.
pub const SCHEMA_VERSION: u32 = 1;

/// Server-side clock expression. RFC 3339, UTC, millisecond precision.
pub const SQLITE_NOW: &str = "strftime('%Y-%m-%dT%H:%M:%fZ', 'now')";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// Store-assigned surrogate key; never written by the insert paths.
    Identity,
    Integer,
    Text,
    Timestamp,
    /// Opaque reference to an out-of-band large object.
    Oid,
}

impl ColumnType {
    fn sqlite_type(self) -> &'static str {
        match self {
            ColumnType::Identity | ColumnType::Integer | ColumnType::Oid => "INTEGER",
            ColumnType::Text | ColumnType::Timestamp => "TEXT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnDefault {
    Now,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnDelete {
    Cascade,
    SetNull,
    Restrict,
}

impl OnDelete {
    fn sql(self) -> &'static str {
        match self {
            OnDelete::Cascade => "CASCADE",
            OnDelete::SetNull => "SET NULL",
            OnDelete::Restrict => "RESTRICT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub table: &'static str,
    pub column: &'static str,
    pub on_delete: OnDelete,
}

/// Named boolean predicate over the row's column values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckConstraint {
    pub name: &'static str,
    pub predicate: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: &'static str,
    pub ty: ColumnType,
    pub nullable: bool,
    pub unique: bool,
    pub default: Option<ColumnDefault>,
    pub check: Option<CheckConstraint>,
    pub references: Option<ForeignKey>,
}

impl ColumnDef {
    pub fn new(name: &'static str, ty: ColumnType) -> Self {
        Self {
            name,
            ty,
            nullable: ty != ColumnType::Identity,
            unique: false,
            default: None,
            check: None,
            references: None,
        }
    }

    pub fn identity(name: &'static str) -> Self {
        Self::new(name, ColumnType::Identity)
    }

    pub fn text(name: &'static str) -> Self {
        Self::new(name, ColumnType::Text)
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn default_now(mut self) -> Self {
        self.default = Some(ColumnDefault::Now);
        self
    }

    pub fn check(mut self, name: &'static str, predicate: &'static str) -> Self {
        self.check = Some(CheckConstraint { name, predicate });
        self
    }

    pub fn references(
        mut self,
        table: &'static str,
        column: &'static str,
        on_delete: OnDelete,
    ) -> Self {
        self.references = Some(ForeignKey {
            table,
            column,
            on_delete,
        });
        self
    }

    /// Column clause as it appears inside `CREATE TABLE` / `ADD COLUMN`.
    pub fn definition_sql(&self) -> String {
        if self.ty == ColumnType::Identity {
            return format!("{} INTEGER PRIMARY KEY AUTOINCREMENT", self.name);
        }
        let mut sql = format!("{} {}", self.name, self.ty.sqlite_type());
        if !self.nullable {
            sql.push_str(" NOT NULL");
        }
        if self.unique {
            sql.push_str(" UNIQUE");
        }
        if let Some(ColumnDefault::Now) = self.default {
            sql.push_str(&format!(" DEFAULT ({SQLITE_NOW})"));
        }
        if let Some(ck) = &self.check {
            sql.push_str(&format!(" CONSTRAINT {} CHECK ({})", ck.name, ck.predicate));
        }
        if let Some(fk) = &self.references {
            sql.push_str(&format!(
                " REFERENCES {} ({}) ON DELETE {}",
                fk.table,
                fk.column,
                fk.on_delete.sql()
            ));
        }
        sql
    }

    /// SQLite's `ALTER TABLE ADD COLUMN` rejects these shapes outright.
    pub(crate) fn add_column_obstacle(&self) -> Option<&'static str> {
        if self.ty == ColumnType::Identity {
            Some("identity columns cannot be added to an existing table")
        } else if self.unique {
            Some("UNIQUE columns cannot be added to an existing table")
        } else if self.default.is_some() {
            Some("columns with a non-constant default cannot be added to an existing table")
        } else if !self.nullable {
            Some("NOT NULL columns need a default to be added to an existing table")
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    pub name: &'static str,
    pub columns: Vec<ColumnDef>,
}

impl TableDef {
    pub fn new(name: &'static str, columns: Vec<ColumnDef>) -> Self {
        Self { name, columns }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Tables this one points at, excluding self references.
    pub fn parents(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.columns
            .iter()
            .filter_map(|c| c.references.as_ref().map(|fk| fk.table))
            .filter(move |t| *t != self.name)
    }

    pub fn create_sql(&self) -> String {
        self.create_sql_as(self.name)
    }

    /// Same definition under another table name; used for table rebuilds.
    pub(crate) fn create_sql_as(&self, name: &str) -> String {
        let cols = self
            .columns
            .iter()
            .map(|c| format!("    {}", c.definition_sql()))
            .collect::<Vec<_>>()
            .join(",\n");
        format!("CREATE TABLE {name} (\n{cols}\n)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerDef {
    pub name: &'static str,
    pub table: &'static str,
    /// Everything after `CREATE TRIGGER <name>`.
    pub body: String,
}

impl TriggerDef {
    pub fn create_sql(&self) -> String {
        format!("CREATE TRIGGER {} {}", self.name, self.body)
    }
}

#[derive(Debug, Clone)]
pub struct Schema {
    pub version: u32,
    pub tables: Vec<TableDef>,
    pub triggers: Vec<TriggerDef>,
}

impl Schema {
    pub fn table(&self, name: &str) -> Option<&TableDef> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Parents before children. Fails on dangling references or cycles.
    pub fn creation_order(&self) -> Result<Vec<&TableDef>, CatalogError> {
        for table in &self.tables {
            for col in &table.columns {
                let Some(fk) = &col.references else {
                    continue;
                };
                if self.table(fk.table).is_none() {
                    return Err(CatalogError::SchemaConflict {
                        table: table.name.to_string(),
                        column: col.name.to_string(),
                        reason: format!("references unknown table {}", fk.table),
                    });
                }
            }
        }
        let nodes = self
            .tables
            .iter()
            .map(|t| (t.name.to_string(), t.parents().map(str::to_string).collect()))
            .collect();
        let order = dependency_order(nodes)?;
        Ok(order
            .iter()
            .filter_map(|name| self.table(name))
            .collect())
    }

    /// Children before parents.
    pub fn drop_order(&self) -> Result<Vec<&TableDef>, CatalogError> {
        let mut order = self.creation_order()?;
        order.reverse();
        Ok(order)
    }
}

/// Kahn's algorithm over `(table, parents)` pairs, keeping declaration
/// order among independent tables. Parents not present in `nodes` are
/// treated as already satisfied.
pub(crate) fn dependency_order(
    nodes: Vec<(String, Vec<String>)>,
) -> Result<Vec<String>, CatalogError> {
    let names: BTreeSet<&str> = nodes.iter().map(|(n, _)| n.as_str()).collect();
    let mut pending: HashMap<&str, usize> = HashMap::new();
    for (name, parents) in &nodes {
        let deps: BTreeSet<&str> = parents
            .iter()
            .map(String::as_str)
            .filter(|p| *p != name.as_str() && names.contains(p))
            .collect();
        pending.insert(name.as_str(), deps.len());
    }

    let mut order: Vec<String> = Vec::with_capacity(nodes.len());
    while order.len() < nodes.len() {
        let next = nodes
            .iter()
            .find(|(n, _)| pending.get(n.as_str()) == Some(&0))
            .map(|(n, _)| n.clone());
        let Some(ready) = next else {
            let stuck = nodes
                .iter()
                .find(|(n, _)| pending.contains_key(n.as_str()))
                .map(|(n, _)| n.clone())
                .unwrap_or_default();
            return Err(CatalogError::SchemaConflict {
                table: stuck,
                column: "*".to_string(),
                reason: "foreign keys form a cycle".to_string(),
            });
        };
        pending.remove(ready.as_str());
        for (child, parents) in &nodes {
            if !parents.iter().any(|p| *p == ready && *p != *child) {
                continue;
            }
            if let Some(n) = pending.get_mut(child.as_str()) {
                *n -= 1;
            }
        }
        order.push(ready);
    }
    Ok(order)
}

fn child_table(name: &'static str, body: &'static str) -> TableDef {
    TableDef::new(
        name,
        vec![
            ColumnDef::identity("id"),
            ColumnDef::text("name"),
            ColumnDef::text(body),
            ColumnDef::new("project_id", ColumnType::Integer).references(
                "project",
                "id",
                OnDelete::Cascade,
            ),
        ],
    )
}

/// The automation-project catalog: `project` and its three child tables.
pub fn catalog_schema() -> Schema {
    let project = TableDef::new(
        "project",
        vec![
            ColumnDef::identity("id"),
            ColumnDef::text("git_hash"),
            ColumnDef::text("url"),
            ColumnDef::text("name")
                .not_null()
                .unique()
                .check("ck_project_name_not_empty", "name != ''"),
            ColumnDef::text("description"),
            ColumnDef::new("created_at", ColumnType::Timestamp)
                .not_null()
                .default_now(),
            ColumnDef::new("modified_at", ColumnType::Timestamp)
                .not_null()
                .default_now(),
            // OID of the large object holding the project files.
            ColumnDef::new("large_data_id", ColumnType::Oid),
        ],
    );

    let triggers = vec![
        // Recursive triggers are off, so the inner UPDATE does not re-fire.
        TriggerDef {
            name: "trg_project_touch_modified_at",
            table: "project",
            body: format!(
                "AFTER UPDATE ON project FOR EACH ROW \
                 BEGIN UPDATE project SET modified_at = {SQLITE_NOW} WHERE id = NEW.id; END"
            ),
        },
        TriggerDef {
            name: "trg_project_created_at_immutable",
            table: "project",
            body: "BEFORE UPDATE OF created_at ON project FOR EACH ROW \
                   WHEN NEW.created_at IS NOT OLD.created_at \
                   BEGIN SELECT RAISE(ABORT, 'project.created_at is immutable'); END"
                .to_string(),
        },
    ];

    Schema {
        version: SCHEMA_VERSION,
        tables: vec![
            project,
            child_table("inventory", "inventory"),
            child_table("extra_var", "extra_var"),
            child_table("playbook", "playbook"),
        ],
        triggers,
    }
}
