use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tessera_cache::{MemoryStore, RedisStore, VolatileStore};
use tessera_core::{AppState, Engine, SqlStore};
use tracing_subscriber::EnvFilter;

mod cli;
mod config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tessera=info")),
        )
        .init();

    let args = cli::Args::parse();
    let config = config::Config::load(&args.config)?;

    ensure_data_dirs(&config);

    let db = tessera_db::create_pool(&config.database.url, config.database.max_connections).await?;
    tessera_db::run_migrations(&db).await?;

    let volatile: Arc<dyn VolatileStore> = match &config.redis.url {
        Some(url) => {
            let store = RedisStore::connect(url).await?;
            store.ping().await?;
            tracing::info!("volatile backend: redis at {}", url);
            Arc::new(store)
        }
        None => {
            tracing::info!("volatile backend: in-process (single instance)");
            Arc::new(MemoryStore::new())
        }
    };

    let store = Arc::new(SqlStore::new(db.clone()));
    let engine = Engine::start(config.batching.engine_config(), store, volatile);

    let state = AppState {
        engine: Arc::clone(&engine),
    };
    let app = tessera_api::build_router().with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind_address).await?;

    print_startup_banner(&config);

    let shutdown_engine = Arc::clone(&engine);
    let shutdown_signal = async move {
        let _ = tokio::signal::ctrl_c().await;
        println!();
        tracing::info!("Shutting down...");
        shutdown_engine.shutdown().await;
    };

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    Ok(())
}

/// Ensure the SQLite database directory exists before the pool connects.
fn ensure_data_dirs(config: &config::Config) {
    if let Some(db_path) = config
        .database
        .url
        .strip_prefix("sqlite://")
        .and_then(|s| s.split('?').next())
    {
        if let Some(parent) = std::path::Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    tracing::warn!("Could not create directory {:?}: {}", parent, e);
                }
            }
        }
    }
}

fn print_startup_banner(config: &config::Config) {
    println!();
    println!("  Tessera: per-chat tamper-evident message batching");
    println!();
    println!("  Listening:    http://{}", config.server.bind_address);
    println!("  Database:     {}", config.database.url);
    println!(
        "  Redis:        {}",
        config.redis.url.as_deref().unwrap_or("(in-process store)")
    );
    println!(
        "  Batching:     size {}, timeout {} ms, lease {} ms",
        config.batching.batch_size,
        config.batching.batch_timeout_ms,
        config.batching.lock_ttl_ms
    );
    println!();
}
