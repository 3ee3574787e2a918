//! # Tollgate API Server
//!
//! Actix-web server that rate limits every request per client and makes
//! unsafe requests carrying an `Idempotency-Key` header safe to retry.

use std::sync::Arc;

use actix_web::{App, HttpServer, web};
use tracing_actix_web::TracingLogger;

use tollgate_core::ports::RateLimiter;
use tollgate_infra::IdempotencyCleaner;

mod config;
mod handlers;
mod middleware;
mod observability;
mod state;
mod telemetry;

use config::AppConfig;
use middleware::{IdempotencyMiddleware, RateLimitMiddleware};
use observability::RequestIdMiddleware;
use state::AppState;
use telemetry::TelemetryConfig;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    telemetry::init_telemetry(&TelemetryConfig::from_env());

    // Load configuration
    let config = AppConfig::from_env();

    tracing::info!(
        "Starting Tollgate API Server on {}:{}",
        config.host,
        config.port
    );

    // Build application state
    let state = AppState::new(&config).await;

    // Background tasks
    state.limiter.start();
    let cleaner = IdempotencyCleaner::new(state.store.clone(), config.cleaner.clone()).start();

    let limiter: Arc<dyn RateLimiter> = state.limiter.clone();
    let rate_limit_options = config.rate_limit_options.clone();
    let server_state = state.clone();
    let max_body_bytes = config.max_body_bytes;

    // Start HTTP server. The last `wrap` runs first.
    let result = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(server_state.clone()))
            .app_data(web::PayloadConfig::new(max_body_bytes))
            .wrap(IdempotencyMiddleware::new(server_state.coordinator.clone()))
            .wrap(RateLimitMiddleware::with_options(
                limiter.clone(),
                rate_limit_options.clone(),
            ))
            .wrap(RequestIdMiddleware)
            .wrap(TracingLogger::default())
            .configure(handlers::configure_routes)
    })
    .bind((config.host.as_str(), config.port))?
    .run()
    .await;

    tracing::info!("HTTP server stopped, shutting down background tasks");
    state.limiter.stop().await;
    if let Err(e) = cleaner.shutdown(config.shutdown_timeout).await {
        tracing::warn!(error = %e, "Idempotency cleaner did not stop cleanly");
    }

    result
}
