pub mod config;
pub mod db;
pub mod error;
pub mod service;

pub use error::CatalogError;
pub use service::CatalogOps;
