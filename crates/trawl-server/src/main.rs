use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use trawl_client::{HttpFetcher, WebExtractor};
use trawl_core::traits::ResultCache;
use trawl_core::{
    Broadcaster, ExtractorRegistry, MemoryCache, MemoryContentStore, Orchestrator,
    OrchestratorConfig, Platform,
};
use trawl_server::routes;
use trawl_server::state::AppState;

const MAX_BODY_BYTES: usize = 64 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("trawl=info".parse()?))
        .with_target(false)
        .init();

    let api_key =
        std::env::var("TRAWL_SERVER_API_KEY").context("TRAWL_SERVER_API_KEY must be set")?;
    let port = std::env::var("TRAWL_SERVER_PORT").unwrap_or_else(|_| "3000".to_string());
    let sweep_secs: u64 = match std::env::var("TRAWL_CACHE_SWEEP_SECS") {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("Invalid TRAWL_CACHE_SWEEP_SECS '{raw}'"))?,
        Err(_) => 60,
    };
    let addr = format!("0.0.0.0:{port}");

    let config = OrchestratorConfig::from_env()?;
    let extractors =
        ExtractorRegistry::new().register(Platform::Web, WebExtractor::new(HttpFetcher::new()?));
    let cache = MemoryCache::new(config.cache_max_entries, config.cache_ttls.clone());
    let broadcaster = Broadcaster::new(config.subscriber_buffer);
    let orchestrator = Orchestrator::new(
        config,
        extractors,
        cache.clone(),
        MemoryContentStore::new(),
        broadcaster,
    )?;
    tracing::info!(platforms = ?orchestrator.supported_platforms(), "Orchestrator ready");

    let sweeper = tokio::spawn(sweep_cache(cache, Duration::from_secs(sweep_secs.max(1))));

    let state = Arc::new(AppState {
        orchestrator: orchestrator.clone(),
        api_key,
    });

    let app = routes::router(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    tracing::info!("Starting server on {addr}");
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    orchestrator.shutdown().await;
    tracing::info!("Server stopped");
    Ok(())
}

/// Periodically purge expired cache entries.
async fn sweep_cache(cache: MemoryCache, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match cache.sweep().await {
            Ok(()) => tracing::debug!(entries = cache.entry_count(), "Cache swept"),
            Err(e) => tracing::warn!(error = %e, "Cache sweep failed"),
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install CTRL+C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
