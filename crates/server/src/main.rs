//! Second Brain daemon.
//!
//! Points a background indexer at a folder of personal documents and serves
//! semantic search and chat over them:
//!
//! - `GET  /status` - index, cache, and resync state
//! - `POST /ingest` - queue a resync (`?full_rebuild=true` to start over)
//! - `GET  /search` - semantic search (`?q=...&k=5`)
//! - `POST /chat`   - retrieval-augmented answer with citations

use anyhow::{Context, Result};
use brain_indexer::{spawn_resync_driver, ChangeNotifier, FsLoader, DATA_DIR};
use brain_query_cache::QueryCache;
use brain_rate_limit::RateLimiter;
use brain_vector_store::{Embedder, HashEmbedder, IndexCoordinator};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use brain_server::generate::{Generator, OllamaGenerator};
use brain_server::service::BrainService;
use brain_server::{config, http};

const JANITOR_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = config::Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let resolved = config::resolve(cli)?;
    let settings = resolved.settings.clone();
    tokio::fs::create_dir_all(&resolved.root)
        .await
        .with_context(|| format!("creating data root {}", resolved.root.display()))?;

    log::info!("Second Brain daemon starting over {}", resolved.root.display());

    // Shared components.
    let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(settings.embedding_dimension));
    let store_path = resolved.root.join(DATA_DIR).join("index.json");
    let coordinator = Arc::new(IndexCoordinator::open(store_path).await);
    let cache = Arc::new(QueryCache::new(settings.cache_config()));
    let limiter = Arc::new(RateLimiter::new(settings.rate_limit_config()));

    // Any successful index write invalidates every cached query.
    {
        let cache = cache.clone();
        coordinator.add_write_hook(move || cache.invalidate_all());
    }

    // Watch + resync pipeline.
    let loader = Arc::new(FsLoader::new(&resolved.root, settings.loader_config())?);
    let (notifier, signal_rx) = ChangeNotifier::start(
        &resolved.root,
        settings.loader_config(),
        settings.notifier_config(),
    )?;
    let resync = spawn_resync_driver(
        loader,
        embedder.clone(),
        coordinator.clone(),
        signal_rx,
        settings.driver_config(),
    );

    let generator: Arc<dyn Generator> = Arc::new(OllamaGenerator::new(
        settings.ollama_host.clone(),
        settings.ollama_model.clone(),
        Duration::from_secs(settings.generation_timeout_secs),
    )?);

    // Janitors: sweep dead cache entries and idle client budgets.
    {
        let cache = cache.clone();
        let limiter = limiter.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(JANITOR_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let swept = cache.evict_expired();
                let reaped = limiter.reap_idle();
                if swept > 0 || reaped > 0 {
                    log::debug!("Janitor: {swept} cache entries, {reaped} client budgets");
                }
            }
        });
    }

    // Cold start: bring the index up to date without waiting for a
    // filesystem event.
    resync.trigger(resolved.rebuild_on_start).await?;

    let service = Arc::new(BrainService::new(
        resolved.root.clone(),
        embedder,
        coordinator,
        cache,
        limiter,
        generator,
        resync,
    ));

    let app = http::router(service);
    let listener = tokio::net::TcpListener::bind(resolved.listen)
        .await
        .with_context(|| format!("binding {}", resolved.listen))?;
    log::info!("Listening on {}", resolved.listen);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    drop(notifier);
    log::info!("Second Brain daemon stopped");
    Ok(())
}
