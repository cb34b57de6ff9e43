use crate::error::CatalogError;
use figment::{
    Figment,
    providers::{Env, Serialized},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How whitespace-only project names are treated before the literal
/// `name != ''` check in the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NamePolicy {
    /// Only the empty string is rejected; `"   "` is a valid name.
    Literal,
    /// Names that are empty after trimming are rejected.
    #[default]
    Trimmed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database_url: String,
    pub max_connections: u32,
    pub busy_timeout_ms: u64,
    pub retry_attempts: usize,
    pub name_policy: NamePolicy,
    pub loglevel: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite://data.sqlite".to_string(),
            max_connections: 8,
            busy_timeout_ms: 5_000,
            retry_attempts: 3,
            name_policy: NamePolicy::default(),
            loglevel: "info".to_string(),
        }
    }
}

impl Config {
    /// Defaults overlaid with `EDA_*` environment variables
    /// (e.g. `EDA_DATABASE_URL`, `EDA_NAME_POLICY=literal`).
    pub fn load() -> Result<Self, CatalogError> {
        Self::extract(
            Figment::from(Serialized::defaults(Config::default())).merge(Env::prefixed("EDA_")),
        )
    }

    fn extract(figment: Figment) -> Result<Self, CatalogError> {
        Ok(figment.extract()?)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}
