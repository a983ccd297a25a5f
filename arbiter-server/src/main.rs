//! Job-server entry point.
//!
//! Exit codes: 0 on clean shutdown, 1 on initialization failure (bad
//! config, database connection, notify watch or signal setup).

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use arbiter_server::config::{RuntimeConfig, CONFIG_FILE};
use arbiter_server::dispatcher::Dispatcher;
use arbiter_server::files::FileStore;
use arbiter_server::notify;
use arbiter_server::store::postgres::PgStore;
use arbiter_server::store::Store;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run() {
        error!("{e:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build the tokio runtime")?;
    runtime.block_on(serve())
}

async fn serve() -> Result<()> {
    let config = Arc::new(RuntimeConfig::load(Path::new(CONFIG_FILE))?);
    let files = Arc::new(FileStore::new(&config.data_dir).context("failed to prepare data_dir")?);

    let database_url = config.database_url()?;
    let pool = PgPoolOptions::new()
        .max_connections(config.job_server_workers as u32 + 1)
        .connect(&database_url)
        .await
        .context("failed to connect to the database")?;
    let store = PgStore::new(pool);
    store.migrate().await?;
    let store: Arc<dyn Store> = Arc::new(store);

    let notify_rx = notify::watch(files.notify_path())?;

    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sigquit = signal(SignalKind::quit()).context("failed to install SIGQUIT handler")?;
    let shutdown = async move {
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
            _ = sigquit.recv() => {}
        }
        info!("shutdown signal received");
    };

    info!(
        pid = std::process::id(),
        workers = config.job_server_workers,
        "=================== Job server launched ==================="
    );

    Dispatcher::new(store, files, config)
        .run(notify_rx, shutdown)
        .await?;
    info!("Job server has shut down.");
    Ok(())
}
