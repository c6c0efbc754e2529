use agstack_infra::{
    config::Config,
    db::{setup_db, setup_es, shutdown_db, shutdown_es, ConnectionRegistry},
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::from_env()?;

    let pool = setup_db(&config.database).await?;
    let registry = ConnectionRegistry::new();
    setup_es(&registry, &config.search).await?;

    tracing::info!("Infrastructure ready, press Ctrl-C to shut down");
    tokio::signal::ctrl_c().await?;

    if let Err(e) = shutdown_es(&registry).await {
        tracing::error!(error = %e, "Failed to close search connection");
    }
    shutdown_db(&pool).await;

    Ok(())
}
