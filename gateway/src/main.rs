mod auth;
mod config;
mod db;
mod errors;
mod identity;
#[cfg(test)]
mod memory;
mod metrics;
mod model;
mod protocol;
mod rest;
mod rooms;
mod session;
mod telemetry;
mod validate;
mod ws;

use auth::Authenticator;
use axum::{routing::get, Router};
use config::Config;
use identity::PrincipalResolver;
use rooms::RoomRegistry;
use session::SessionManager;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();

    info!("Starting telemetry gateway");
    info!("HTTP server: {}", config.http_addr);
    info!("Database: {}", config.redacted_database_url());
    for name in config.insecure_defaults() {
        warn!("{} is not set, using the built-in development secret", name);
    }

    if let Err(e) = metrics::init_metrics() {
        error!("Failed to register metrics: {}", e);
        std::process::exit(1);
    }

    let pool = match db::make_pool(&config.database_url, config.db_max_connections).await {
        Ok(pool) => pool,
        Err(e) => {
            error!("Failed to connect to database: {}", e);
            std::process::exit(1);
        }
    };

    let store = Arc::new(db::PgStore::new(pool));
    let authenticator = Authenticator::new(
        &config.sensor_secret,
        &config.dashboard_secret,
        PrincipalResolver::new(store.clone()),
    );
    let manager = Arc::new(SessionManager::new(
        authenticator,
        Arc::new(RoomRegistry::new()),
        store.clone(),
    ));

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .merge(ws::create_router(manager.clone()))
        .merge(rest::create_router(manager, store));

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .unwrap_or_else(|e| {
            error!("Failed to bind to {}: {}", config.http_addr, e);
            std::process::exit(1);
        });

    info!("HTTP server listening on {}", config.http_addr);

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap_or_else(|e| {
            error!("HTTP server error: {}", e);
        });
    });

    tokio::select! {
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down");
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}

async fn health_handler() -> &'static str {
    "ok"
}
