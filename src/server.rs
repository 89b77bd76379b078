//! # Server Module
//!
//! Wires the pipeline together and serves the read API. Startup order:
//! program registry, store, pool and pattern state restored from the store,
//! then the feed, ingest workers and synthesis scheduler, then HTTP.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::database::{self, Store};
use crate::pipeline::analysis_client::{AnalysisClient, AnalysisService};
use crate::pipeline::decoder::Decoder;
use crate::pipeline::feed::{RpcPollingSource, spawn_feed};
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::ingest::Pipeline;
use crate::pipeline::patterns::PatternBook;
use crate::pipeline::pool_tracker::PoolTracker;
use crate::pipeline::registry::ProgramRegistry;
use crate::pipeline::synthesizer::Synthesizer;
use crate::pipeline::types::PipelineError;
use crate::routes::{health, ledger, reports};

/// Application state shared across all route handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub pools: Arc<PoolTracker>,
    pub patterns: Arc<PatternBook>,
    pub registry: Arc<ProgramRegistry>,
    pub health: Arc<PipelineHealth>,
    pub synthesizer: Arc<Synthesizer>,
    pub wallet: String,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ping", get(health::ping))
        .route("/health", get(health::health))
        .merge(ledger::create_routes())
        .merge(reports::create_routes())
        .layer(
            ServiceBuilder::new().layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods([
                        axum::http::Method::GET,
                        axum::http::Method::POST,
                        axum::http::Method::OPTIONS,
                    ])
                    .allow_headers([
                        axum::http::header::ORIGIN,
                        axum::http::header::CONTENT_TYPE,
                        axum::http::header::ACCEPT,
                    ]),
            ),
        )
        .with_state(state)
}

/// Marks the pipeline failed when the feed gives up reconnecting.
fn supervise_feed(
    feed: JoinHandle<Result<(), PipelineError>>,
    health: Arc<PipelineHealth>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match feed.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("❌ Feed stopped: {}", e);
                health.record_failure(&e);
            }
            Err(e) => {
                error!("❌ Feed task panicked: {}", e);
                health.record_failure(&e);
            }
        }
    })
}

async fn shutdown_signal(shutdown: watch::Sender<bool>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("🛑 Shutdown requested");
    let _ = shutdown.send(true);
}

/// Starts the pipeline and the HTTP server, running until ctrl-c.
pub async fn start(config: Config) -> Result<()> {
    let wallet = config.wallet.address.clone();

    let registry = Arc::new(
        ProgramRegistry::load_dir(&config.registry.schema_dir).context("Failed to load program schemas")?,
    );
    let store = database::open_store(&config.database).await?;
    let health = Arc::new(PipelineHealth::new());

    let pools = Arc::new(PoolTracker::new(store.clone()));
    let restored = pools.hydrate().await.context("Failed to restore pool states")?;
    let patterns = Arc::new(PatternBook::from_config(&config.patterns));
    let cut = patterns.recompute(store.as_ref()).await.context("Failed to rebuild patterns")?;
    info!(
        "📚 Restored {} ledger entries, {} pools, {} patterns",
        cut.transactions.len(),
        restored,
        cut.patterns.len()
    );

    let service: Arc<dyn AnalysisService> =
        Arc::new(AnalysisClient::from_config(&config.synthesis).context("Failed to build analysis client")?);
    let synthesizer = Arc::new(Synthesizer::new(
        store.clone(),
        pools.clone(),
        patterns.clone(),
        service,
        health.clone(),
        wallet.clone(),
        config.synthesis.timeout(),
        config.synthesis.lookback_days,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let cursor = store.load_cursor().await.context("Failed to read feed cursor")?;
    match &cursor {
        Some(signature) => info!("📍 Resuming feed after {}", signature),
        None if config.feed.backfill_hours > 0 => {
            info!("📍 No feed cursor, backfilling the last {}h", config.feed.backfill_hours)
        }
        None => info!("📍 No feed cursor, starting from the latest signatures"),
    }
    let source = RpcPollingSource::new(&config.feed, wallet.clone(), cursor, health.clone())
        .context("Failed to build RPC source")?;
    let (events, feed) = spawn_feed(Box::new(source), config.feed.channel_capacity, shutdown_rx.clone());
    let feed = supervise_feed(feed, health.clone());

    let pipeline = Arc::new(Pipeline::new(
        Decoder::new(registry.clone(), wallet.clone()),
        store.clone(),
        pools.clone(),
        patterns.clone(),
        health.clone(),
        config.pipeline.clone(),
    ));
    let ingest = tokio::spawn(pipeline.run(events, shutdown_rx.clone()));
    let scheduler = tokio::spawn(synthesizer.clone().run_schedule(config.synthesis.clone(), shutdown_rx));

    let app = create_router(AppState {
        store,
        pools,
        patterns,
        registry,
        health,
        synthesizer,
        wallet: wallet.clone(),
    });

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid server address")?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {} - port may already be in use", addr))?;

    info!("🚀 Wallet Insight Server starting...");
    info!("👛 Monitoring wallet {}", wallet);
    info!("📡 Listening on http://{}", addr);
    info!("🏥 Health check available at http://{}/health", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .context("HTTP server error")?;

    // in-flight writes finish before the store is dropped
    feed.await.context("Feed supervisor panicked")?;
    if let Err(e) = ingest.await.context("Ingest task panicked")? {
        warn!("Ingest ended with error: {}", e);
    }
    scheduler.await.context("Synthesis scheduler panicked")?;

    info!("👋 Shutdown complete");
    Ok(())
}
