use crate::config::Config;
use crate::db::migrate::{Migrator, catalog_migrations};
use crate::db::models::{
    ChildKind, ChildRecord, NewChild, NewProject, Project, ProjectPatch, ProjectRef,
};
use crate::db::sqlite::{CatalogStorage, connect};
use crate::error::{CatalogError, IsRetryable};
use backon::{ExponentialBuilder, Retryable};
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// `attempts` counts the first call; backon counts only the retries after it.
fn retry_policy(attempts: usize) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(1))
        .with_max_times(attempts.saturating_sub(1))
        .with_jitter()
}

/// Catalog operations with bounded retry on lock contention and lost
/// connections. Constraint failures are returned to the caller untouched.
#[derive(Clone)]
pub struct CatalogOps {
    storage: CatalogStorage,
    retry_attempts: usize,
}

impl CatalogOps {
    /// Open the configured database and bring its schema up to date.
    pub async fn new(cfg: &Config) -> Result<Self, CatalogError> {
        let pool = connect(cfg).await?;
        let report = Migrator::new(pool.clone())
            .run(&catalog_migrations())
            .await?;
        info!(
            applied = report.applied.len(),
            skipped = report.skipped.len(),
            statements = report.statements,
            "catalog schema ready"
        );
        let storage = CatalogStorage::new(pool, cfg.name_policy);
        Ok(Self::from_storage(storage, cfg.retry_attempts))
    }

    pub fn from_storage(storage: CatalogStorage, retry_attempts: usize) -> Self {
        Self {
            storage,
            retry_attempts,
        }
    }

    pub fn storage(&self) -> &CatalogStorage {
        &self.storage
    }

    pub fn migrator(&self) -> Migrator {
        Migrator::new(self.storage.pool().clone())
    }

    async fn with_retry<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T, CatalogError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CatalogError>>,
    {
        f.retry(retry_policy(self.retry_attempts))
            .when(|e: &CatalogError| e.is_retryable())
            .notify(|err, dur: Duration| {
                warn!(op, error = %err, "retrying after {:?}", dur);
            })
            .await
    }

    pub async fn create_project(&self, new: NewProject) -> Result<Project, CatalogError> {
        self.with_retry("create_project", || async {
            self.storage.create_project(new.clone()).await
        })
        .await
    }

    pub async fn get_project(&self, id: i64) -> Result<Project, CatalogError> {
        self.with_retry("get_project", || self.storage.get_project(id))
            .await
    }

    pub async fn find_project_by_name(&self, name: &str) -> Result<Option<Project>, CatalogError> {
        self.with_retry("find_project_by_name", || {
            self.storage.find_project_by_name(name)
        })
        .await
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>, CatalogError> {
        self.with_retry("list_projects", || self.storage.list_projects())
            .await
    }

    pub async fn update_project(
        &self,
        id: i64,
        patch: ProjectPatch,
    ) -> Result<Project, CatalogError> {
        self.with_retry("update_project", || async {
            self.storage.update_project(id, patch.clone()).await
        })
        .await
    }

    pub async fn set_large_data(
        &self,
        id: i64,
        large_data_id: Option<i64>,
    ) -> Result<Project, CatalogError> {
        self.with_retry("set_large_data", || {
            self.storage.set_large_data(id, large_data_id)
        })
        .await
    }

    pub async fn delete_project(&self, id: i64) -> Result<u64, CatalogError> {
        self.with_retry("delete_project", || self.storage.delete_project(id))
            .await
    }

    pub async fn attach_child(&self, new: NewChild) -> Result<ChildRecord, CatalogError> {
        self.with_retry("attach_child", || async {
            self.storage.attach_child(new.clone()).await
        })
        .await
    }

    pub async fn get_child(&self, kind: ChildKind, id: i64) -> Result<ChildRecord, CatalogError> {
        self.with_retry("get_child", || self.storage.get_child(kind, id))
            .await
    }

    pub async fn list_children(
        &self,
        kind: ChildKind,
        project: ProjectRef,
    ) -> Result<Vec<ChildRecord>, CatalogError> {
        self.with_retry("list_children", || {
            self.storage.list_children(kind, project)
        })
        .await
    }

    pub async fn delete_child(&self, kind: ChildKind, id: i64) -> Result<(), CatalogError> {
        self.with_retry("delete_child", || self.storage.delete_child(kind, id))
            .await
    }
}
