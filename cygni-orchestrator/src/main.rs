use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod adapter;
pub mod api;
pub mod config;
pub mod controller;
pub mod db;
pub mod repository;
pub mod service;
pub mod state;

#[cfg(test)]
mod testing;

use config::{Config, StoreBackend};
use state::{Adapters, AppState, Stores};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cygni_orchestrator=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Cygni Orchestrator...");

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    let stores = match config.store {
        StoreBackend::Postgres => {
            tracing::info!("Connecting to database...");

            let pool = db::create_pool(&config.database_url)
                .await
                .context("Failed to create database pool")?;

            tracing::info!("Database connection pool created");

            db::run_migrations(&pool)
                .await
                .context("Failed to run database migrations")?;

            Stores::postgres(pool)
        }
        StoreBackend::Memory => {
            tracing::warn!("Using the in-memory store; state is lost on restart");
            Stores::memory()
        }
    };

    let adapters = Adapters::from_config(&config).context("Failed to build adapters")?;
    let state = AppState::assemble(&config, stores, adapters);

    let resumed = state
        .canaries
        .resume_running()
        .await
        .context("Failed to resume canary control loops")?;
    if resumed > 0 {
        tracing::info!("Resumed {} running canary release(s)", resumed);
    }

    // Build router with all API endpoints
    let app = api::create_router(state);

    tracing::info!("Listening on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

    axum::serve(listener, app)
        .await
        .context("Server terminated")?;

    Ok(())
}
