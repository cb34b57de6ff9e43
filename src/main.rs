use eda_catalog::CatalogOps;
use eda_catalog::config::Config;
use mimalloc::MiMalloc;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let cfg = Config::load()?;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cfg.loglevel.clone()));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_level(true)
                .with_target(false),
        )
        .init();

    info!(
        database_url = %cfg.database_url,
        max_connections = cfg.max_connections,
        name_policy = ?cfg.name_policy,
        loglevel = %cfg.loglevel
    );

    let ops = CatalogOps::new(&cfg).await?;
    let ledger = ops.migrator().applied().await?;
    let projects = ops.list_projects().await?;
    info!(
        migrations = ledger.len(),
        projects = projects.len(),
        "catalog is up to date"
    );
    println!("{}", serde_json::to_string_pretty(&ledger)?);

    ops.storage().pool().close().await;
    Ok(())
}
