//! PantryBot - Household Pantry Inventory Predictor
//!
//! Learns per-product consumption cycles from the inventory event log and
//! keeps days-left forecasts current. Two daily jobs advance the product
//! population: state decay and weekly cycle re-estimation.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pantrybot_backend::api::{build_router, AppState};
use pantrybot_backend::clock::SystemClock;
use pantrybot_backend::models::Config;
use pantrybot_backend::predictor::service::PredictorService;
use pantrybot_backend::scheduler::{daily_state_decay_polling, weekly_reestimation_polling};
use pantrybot_backend::storage::{PantryRepository, PantryStore};

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pantrybot_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::from_env()?;
    info!("🥫 Starting PantryBot backend on port {}", config.port);

    let store = Arc::new(PantryStore::new(&config.database_path)?);
    let repo: Arc<dyn PantryRepository> = store;
    let clock = Arc::new(SystemClock);
    let service = Arc::new(PredictorService::new(repo.clone(), clock));

    let mut job_handles = Vec::new();
    if config.schedulers_enabled {
        job_handles.push(tokio::spawn(daily_state_decay_polling(service.clone())));
        job_handles.push(tokio::spawn(weekly_reestimation_polling(service.clone())));
    } else {
        warn!("⚠️  Background schedulers disabled (SCHEDULERS_ENABLED=0)");
    }

    let app = build_router(AppState {
        service: service.clone(),
        repo,
    })
    .layer(CorsLayer::permissive())
    .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("🚀 Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .context("Server error")?;

    // Stop the daily jobs and wait for them to wind down.
    for handle in &job_handles {
        handle.abort();
    }
    for handle in job_handles {
        let _ = handle.await;
    }

    info!("👋 PantryBot backend stopped");
    Ok(())
}
