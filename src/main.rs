//! CLOB Feed - Market Data Handler
//!
//! Discovers instruments from the REST catalog, streams the market channel and
//! keeps a persisted top-of-book per instrument.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use clob_feed::persistence::{JsonFileSink, MemorySink, TopOfBookSink};
use clob_feed::rate_limiter::{AdaptiveRateLimiter, RateLimiterConfig};
use clob_feed::{AppState, CatalogClient, Config, FeedHandle, FeedService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Starting CLOB feed");

    let config = Config::load()?;
    info!(
        ws_endpoint = %config.ws_endpoint,
        seed_instruments = config.asset_ids.len(),
        discover_catalog = config.discover_catalog,
        "Configuration loaded"
    );

    let sink: Arc<dyn TopOfBookSink> = match &config.persistence_path {
        Some(path) => Arc::new(
            JsonFileSink::open(path)
                .await?
                .with_flush_interval(config.persistence_flush_interval()),
        ),
        None => {
            info!("No persistence path configured, keeping tables in memory");
            Arc::new(MemorySink::new())
        }
    };

    let state = Arc::new(AppState::new(config)?);

    if state.config.discover_catalog {
        discover_instruments(&state, sink.as_ref()).await;
    }
    if state.subscriptions.is_empty() {
        warn!("No instruments to subscribe to; the feed will idle until one is added");
    }

    let service = FeedService::start(state.clone(), sink);
    let handle = service.handle();

    let health_port = state.config.health_port;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(handle, health_port).await {
            warn!(error = %e, "Health server error");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received");

    if let Err(e) = service.shutdown().await {
        error!(error = %e, "Shutdown did not complete cleanly");
    }
    Ok(())
}

/// Load the catalog, persist markets and subscribe to their instruments.
///
/// Discovery failure is not fatal: the feed still runs on the seed ids.
async fn discover_instruments(state: &AppState, sink: &dyn TopOfBookSink) {
    let limiter = match AdaptiveRateLimiter::new(RateLimiterConfig::from_config(&state.config)) {
        Ok(limiter) => Arc::new(limiter),
        Err(e) => {
            warn!(error = %e, "Invalid REST limiter settings, skipping discovery");
            return;
        }
    };
    let client = CatalogClient::new(&state.config.rest_endpoint, limiter);

    let markets = match client.discover(&state.catalog).await {
        Ok(markets) => markets,
        Err(e) => {
            warn!(error = %e, "Catalog discovery failed, continuing with seed instruments");
            return;
        }
    };

    let now = chrono::Utc::now();
    for (market, instruments) in &markets {
        if let Err(e) = sink.upsert_market(market, instruments).await {
            warn!(market_id = %market.id, error = %e, "Failed to persist market");
        }
        if market.expiry.is_some_and(|expiry| expiry <= now) {
            continue;
        }
        state
            .subscriptions
            .add(instruments.iter().map(|instrument| instrument.id.clone()));
    }
}

/// Start HTTP server for health checks and metrics
async fn start_health_server(handle: FeedHandle, port: u16) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(handle);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(addr = %addr, "Starting health check server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check(State(handle): State<FeedHandle>) -> Json<serde_json::Value> {
    let connection = handle.connection_state();
    let status = if connection.is_live() { "healthy" } else { "degraded" };
    let books = handle.book_count().await;
    Json(serde_json::json!({
        "status": status,
        "component": "clob-feed",
        "connection": connection,
        "instruments": handle.subscribed_count(),
        "books": books,
        "persistence_degraded": handle.persistence_degraded(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn metrics(State(handle): State<FeedHandle>) -> Result<String, StatusCode> {
    handle.metrics().encode().map_err(|e| {
        warn!(error = %e, "Failed to encode metrics");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}
