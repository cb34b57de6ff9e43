//! Database module: schema definition, migrations and integrity-enforced storage.
//!
//! Layout:
//! - `schema.rs`: declarative table definitions and their SQLite DDL
//! - `migrate.rs`: ledger-tracked, idempotent migration engine
//! - `models.rs`: Rust structs mirroring catalog rows
//! - `sqlite.rs`: pool setup and constraint-mapped CRUD

pub mod migrate;
pub mod models;
pub mod schema;
pub mod sqlite;

pub use migrate::{Migration, MigrationReport, MigrationStep, Migrator, catalog_migrations};
pub use models::{ChildKind, ChildRecord, NewChild, NewProject, Project, ProjectPatch, ProjectRef};
pub use schema::{SCHEMA_VERSION, Schema, catalog_schema};
pub use sqlite::{CatalogStorage, SqlitePool, connect};
