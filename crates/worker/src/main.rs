use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use jobforge_infra::config::JobsConfig;
use jobforge_infra::jobs::{
    HandlerRegistry, JobService, JobWorker, WorkerConfig, register_builtin_handlers,
};
use jobforge_infra::log_store::PostgresJobLogStore;
use jobforge_infra::store::PostgresJobStore;
use jobforge_infra::store::postgres::migrate;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = JobsConfig::from_env().context("invalid configuration")?;
    jobforge_observability::init_with(config.log_format);

    let database_url = config.require_database_url()?;
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(database_url)
        .await
        .context("failed to connect to database")?;
    migrate(&pool).await.context("failed to apply schema")?;

    // Store calls block on this runtime from the worker thread.
    let runtime = tokio::runtime::Handle::current();
    let store = Arc::new(PostgresJobStore::new(pool.clone(), runtime.clone()));
    let logs = Arc::new(PostgresJobLogStore::new(pool.clone(), runtime));

    let mut registry = HandlerRegistry::new();
    register_builtin_handlers(&mut registry, store.clone(), logs.clone(), config.retention_days)?;

    let service = Arc::new(JobService::from_config(store, logs, registry, &config));
    info!(
        handlers = ?service.registry().types(),
        batch_size = config.batch_size,
        max_concurrent = config.max_concurrent,
        "starting job worker"
    );
    let handle = JobWorker::spawn(service, WorkerConfig::from(&config))
        .context("failed to spawn worker thread")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested; waiting for the current batch");

    tokio::task::spawn_blocking(move || handle.shutdown()).await?;
    pool.close().await;
    info!("job worker exited");
    Ok(())
}
