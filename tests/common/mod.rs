#![allow(dead_code)]

use eda_catalog::CatalogOps;
use eda_catalog::config::{Config, NamePolicy};
use eda_catalog::db::{SqlitePool, connect};
use std::{
    fs,
    path::PathBuf,
    sync::atomic::{AtomicU32, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

static NEXT: AtomicU32 = AtomicU32::new(0);

/// On-disk SQLite file removed (with its WAL siblings) on drop.
pub struct TempDb {
    pub path: PathBuf,
    pub cfg: Config,
}

impl TempDb {
    pub fn new(name_policy: NamePolicy) -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before UNIX_EPOCH")
            .as_nanos();

        let mut path = std::env::temp_dir();
        path.push(format!(
            "eda-catalog-{}-{}-{}.sqlite",
            std::process::id(),
            nanos,
            NEXT.fetch_add(1, Ordering::Relaxed)
        ));

        let cfg = Config {
            database_url: format!("sqlite:{}", path.display()),
            name_policy,
            ..Config::default()
        };
        Self { path, cfg }
    }

    pub async fn pool(&self) -> SqlitePool {
        connect(&self.cfg).await.expect("failed to open test database")
    }

    pub async fn ops(&self) -> CatalogOps {
        CatalogOps::new(&self.cfg)
            .await
            .expect("failed to open catalog")
    }
}

impl Drop for TempDb {
    fn drop(&mut self) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = fs::remove_file(format!("{}{}", self.path.display(), suffix));
        }
    }
}
