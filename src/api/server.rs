use axum::{
    http::HeaderValue,
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use super::handlers;
use crate::monitor::Monitor;

pub fn create_router(monitor: Arc<Monitor>) -> Router {
    // Set ALLOWED_ORIGINS="https://ops.example.com,https://staging.example.com" to restrict
    // If not set, allows any origin (development mode)
    let cors = match std::env::var("ALLOWED_ORIGINS") {
        Ok(origins) if !origins.is_empty() => {
            log::info!("CORS configured for origins: {}", origins);
            let origin_list: Vec<HeaderValue> = origins
                .split(',')
                .filter_map(|s| match s.trim().parse() {
                    Ok(origin) => Some(origin),
                    Err(_) => {
                        log::warn!("Ignoring invalid CORS origin: {}", s);
                        None
                    }
                })
                .collect();
            CorsLayer::new()
                .allow_origin(origin_list)
                .allow_methods(Any)
                .allow_headers(Any)
        }
        _ => {
            log::warn!("CORS: Allowing all origins (development mode). Set ALLOWED_ORIGINS env var for production.");
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    };

    Router::new()
        .route("/api/state", get(handlers::get_state_handler))
        // Collection routes
        .route("/api/collections", post(handlers::create_collection_handler))
        .route(
            "/api/collections/:collection",
            axum::routing::delete(handlers::delete_collection_handler),
        )
        .route(
            "/api/collections/:collection/addresses",
            post(handlers::add_address_handler),
        )
        .route(
            "/api/collections/:collection/addresses/:address",
            put(handlers::update_address_handler).delete(handlers::delete_address_handler),
        )
        .route(
            "/api/collections/:collection/extended-keys",
            post(handlers::add_extended_key_handler),
        )
        .route(
            "/api/collections/:collection/extended-keys/:name",
            put(handlers::update_extended_key_handler).delete(handlers::delete_extended_key_handler),
        )
        .route(
            "/api/collections/:collection/descriptors",
            post(handlers::add_descriptor_handler),
        )
        .route(
            "/api/collections/:collection/descriptors/:name",
            put(handlers::update_descriptor_handler).delete(handlers::delete_descriptor_handler),
        )
        // Reconciliation routes
        .route("/api/refresh", post(handlers::refresh_handler))
        .route("/api/accept", post(handlers::accept_handler))
        .route("/api/export", get(handlers::export_handler))
        .route("/api/import", post(handlers::import_handler))
        .route(
            "/api/tracking",
            get(handlers::tracked_addresses_handler).post(handlers::tracking_event_handler),
        )
        .layer(cors)
        .with_state(monitor)
}

pub async fn start_server(addr: &str, monitor: Arc<Monitor>) -> anyhow::Result<()> {
    let app = create_router(monitor);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Handle graceful shutdown signals (Ctrl+C, SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            log::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            log::info!("Received SIGTERM signal");
        },
    }

    log::info!("Shutdown signal received, exiting gracefully...");
}
