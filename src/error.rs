use sqlx::Error as SqlxError;
use sqlx::error::ErrorKind;
use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum CatalogError {
    #[error("project name already exists: {0:?}")]
    DuplicateName(String),

    #[error("project name must not be empty")]
    EmptyName,

    #[error("{table}.project_id references missing project {project_id}")]
    ForeignKeyViolation { table: &'static str, project_id: i64 },

    #[error("schema conflict on {table}.{column}: {reason}")]
    SchemaConflict {
        table: String,
        column: String,
        reason: String,
    },

    #[error("{table} row {id} not found")]
    NotFound { table: &'static str, id: i64 },

    #[error("Connection error: {0}")]
    ConnectionError(#[source] SqlxError),

    #[error("Timed out waiting for the schema migration lock")]
    MigrationLockTimeout,

    #[error("Database busy: {0}")]
    Busy(#[source] SqlxError),

    #[error("Database error: {0}")]
    Database(#[source] SqlxError),

    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),
}

/// Errors a caller may resubmit unchanged after backing off.
pub trait IsRetryable {
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for CatalogError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            CatalogError::ConnectionError(_) | CatalogError::Busy(_)
        )
    }
}

impl From<SqlxError> for CatalogError {
    fn from(e: SqlxError) -> Self {
        let contended = matches!(
            &e,
            SqlxError::Database(db) if is_lock_contention(db.code().as_deref())
        );
        match e {
            SqlxError::Io(_)
            | SqlxError::Tls(_)
            | SqlxError::PoolTimedOut
            | SqlxError::PoolClosed
            | SqlxError::WorkerCrashed => CatalogError::ConnectionError(e),
            _ if contended => CatalogError::Busy(e),
            other => CatalogError::Database(other),
        }
    }
}

impl From<figment::Error> for CatalogError {
    fn from(e: figment::Error) -> Self {
        CatalogError::Config(Box::new(e))
    }
}

/// SQLite primary result codes 5 (SQLITE_BUSY) and 6 (SQLITE_LOCKED),
/// including their extended forms (`code & 0xff`).
fn is_lock_contention(code: Option<&str>) -> bool {
    code.and_then(|c| c.parse::<i32>().ok())
        .map(|c| matches!(c & 0xff, 5 | 6))
        .unwrap_or(false)
}

/// Constraint family a database error belongs to, if any.
pub(crate) fn constraint_kind(e: &SqlxError) -> Option<ErrorKind> {
    match e {
        SqlxError::Database(db) => match db.kind() {
            ErrorKind::Other => None,
            kind => Some(kind),
        },
        _ => None,
    }
}
