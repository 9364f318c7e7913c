//! HTTP surface
//!
//! Axum router exposing `/upload`, `/health` and, when results are served by
//! URL, `/processed/<name>`.

pub mod error;
pub mod handlers;

use crate::{
    config::ServerConfig,
    error::{BgReplaceError, Result},
    processor::BackgroundReplacementProcessor,
};
use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderValue, Method},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};
use tracing::{info, warn};

/// Room for multipart boundaries and the text fields on top of the image itself
const FORM_OVERHEAD_BYTES: u64 = 64 * 1024;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub processor: Arc<BackgroundReplacementProcessor>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    #[must_use]
    pub fn new(processor: Arc<BackgroundReplacementProcessor>, config: ServerConfig) -> Self {
        Self {
            processor,
            config: Arc::new(config),
        }
    }
}

/// Create the API router with all endpoints
///
/// # Errors
/// - `InvalidConfig` when the CORS origin is not a valid header value
pub fn create_router(state: AppState) -> Result<Router> {
    let body_limit = state
        .config
        .max_upload_bytes
        .saturating_add(FORM_OVERHEAD_BYTES);
    let cors = cors_layer(&state.config.allowed_origin)?;
    let processed_dir = state.processor.store().processed_dir().to_path_buf();
    let serves_results = state.config.retention.serves_urls();

    let mut router = Router::new()
        .route("/health", get(handlers::health_check))
        .route(
            "/upload",
            post(handlers::upload)
                .layer(DefaultBodyLimit::max(usize::try_from(body_limit).unwrap_or(usize::MAX))),
        );

    if serves_results {
        router = router.nest_service("/processed", ServeDir::new(processed_dir));
    }

    Ok(router
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http()))
}

fn cors_layer(origin: &str) -> Result<CorsLayer> {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    if origin.trim() == "*" {
        return Ok(layer.allow_origin(Any));
    }

    let origin = HeaderValue::from_str(origin.trim()).map_err(|e| {
        BgReplaceError::invalid_config(format!("Invalid CORS origin '{}': {}", origin, e))
    })?;
    Ok(layer.allow_origin(origin))
}

/// Run the service until Ctrl-C or SIGTERM
///
/// # Errors
/// - Invalid configuration
/// - Working directories cannot be created
/// - The listener cannot be bound
pub async fn serve(config: ServerConfig) -> Result<()> {
    let processor = Arc::new(BackgroundReplacementProcessor::new(&config)?);
    processor.store().ensure_dirs().await?;

    // only retained composites expire; otherwise the processed dir is left alone
    let sweeper = Arc::clone(processor.store()).spawn_sweeper(config.sweep_interval);

    let addr = config.bind_addr();
    info!(
        address = %addr,
        tool = processor.remover_name(),
        retention = %config.retention,
        max_upload_bytes = config.max_upload_bytes,
        "Starting background replacement service"
    );

    let app = create_router(AppState::new(processor, config))?;
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| BgReplaceError::file_io_error("bind", &addr, &e))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
    info!("Service stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("Shutdown signal received, draining connections");
}
