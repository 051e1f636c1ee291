use anyhow::{Context, Result};
use axum::http::HeaderValue;
use dotenv::dotenv;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod access;
mod api;
mod auth;
mod config;
mod db;
mod directory;
mod error;
mod ledger;
mod model;
mod qrlogin;
mod report;
mod sysconfig;
mod work;

use crate::api::AppState;
use crate::config::Settings;
use crate::qrlogin::{SWEEP_INTERVAL, WeChatClient};

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::permissive();
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin '{}'", origin);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(allowed)
        .allow_methods(Any)
        .allow_headers(Any)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize environment variables from .env file
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting application");

    let settings = Settings::load()?;

    db::migrate(&settings.database).await?;
    let pool = db::init_pool(&settings.database).await?;

    let cors = cors_layer(&settings.server.cors_origins);
    let bind = settings.server.bind.clone();

    let state = AppState::new(pool, settings, Arc::new(WeChatClient::new()));
    let sweeper = state.qr.broker().clone().spawn_sweeper(SWEEP_INTERVAL);

    let app = api::router(state).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(cors),
    );

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {bind}"))?;
    info!("Listening on {}", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    info!("Application stopped");
    Ok(())
}
