//! HTTP transport for the kvetch API.
//!
//! ## Endpoints
//!
//! ### Data
//! - `POST /v1/get` - Resolve keys and prefixes
//! - `POST /v1/set` - Apply an atomic batch (optional `ttl_ms`)
//! - `POST /v1/subscribe` - NDJSON stream: snapshot batches, then live batches
//!
//! Every data route accepts `?encoding=string|hex|json` (default `string`).
//! Values are rendered as a whole response: if any returned value does not
//! fit the encoding (non-UTF-8 bytes under `string`, non-JSON under `json`)
//! the Get fails with 400 naming the key, and a subscription stream ends
//! with an error line. `hex` renders every value.
//!
//! ### System
//! - `GET /health` - Health check
//!
//! Prometheus metrics are served separately by [`metrics_router`] at
//! `GET /metrics`.

use std::future::Future;
use std::time::Instant;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, MatchedPath, Request, State},
    http::{StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tracing::{Instrument, error, info};

use crate::constants::MAX_BODY_SIZE_BYTES;
use crate::error::{Error, Result};
use crate::logging;
use crate::metrics;
use crate::service::ApiService;

mod handlers;
pub mod types;

use types::ErrorResponse;

/// Builds the API router.
pub fn router(service: ApiService) -> Router {
    Router::new()
        .route("/v1/get", post(handlers::get_values))
        .route("/v1/set", post(handlers::set_values))
        .route("/v1/subscribe", post(handlers::subscribe))
        .route("/health", get(handlers::health))
        .with_state(service)
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE_BYTES))
        .layer(middleware::from_fn(request_middleware))
}

/// Builds the router of the metrics listener.
pub fn metrics_router(handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/metrics", get(metrics_endpoint))
        .with_state(handle)
}

/// Serves the API until `shutdown` resolves.
///
/// When shutdown starts the change feed is closed so that open
/// subscription streams end and in-flight requests can drain.
///
/// # Errors
///
/// Returns [`Error::Internal`] if the server fails.
pub async fn serve(
    listener: TcpListener,
    service: ApiService,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Serving kvetch API");
    }

    let feed = service.clone();
    axum::serve(listener, router(service))
        .with_graceful_shutdown(async move {
            shutdown.await;
            feed.shutdown();
        })
        .await
        .map_err(|e| Error::Internal(format!("HTTP server error: {e}")))
}

/// Serves Prometheus metrics until `shutdown` resolves.
///
/// # Errors
///
/// Returns [`Error::Internal`] if the server fails.
pub async fn serve_metrics(
    listener: TcpListener,
    handle: PrometheusHandle,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Serving Prometheus metrics");
    }

    axum::serve(listener, metrics_router(handle))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Error::Internal(format!("metrics server error: {e}")))
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
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
                error!(error = %e, "Failed to install SIGTERM handler");
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

    info!("Shutdown signal received, stopping kvetch...");
}

/// Request logging and metrics.
async fn request_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let request_id = logging::generate_request_id();
    let method = request.method().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| "unmatched".to_string(), |p| p.as_str().to_string());

    let span = tracing::info_span!("request", request_id = %request_id, method = %method, path = %path);
    let response = next.run(request).instrument(span).await;

    let duration = start.elapsed();
    let status = response.status().as_u16();
    metrics::record_http_request(&method, &path, status, duration.as_secs_f64());
    logging::log_request_complete(
        &request_id,
        &method,
        &path,
        status,
        duration.as_millis() as u64,
    );

    response
}

/// GET /metrics - Prometheus metrics endpoint.
async fn metrics_endpoint(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        handle.render(),
    )
}

// =============================================================================
// Error Handling
// =============================================================================

/// Application error types for HTTP responses.
pub(crate) enum AppError {
    BadRequest(String),
    Internal(String),
    ServiceUnavailable(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            Self::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
        };

        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        match err.status_code() {
            400 => Self::BadRequest(err.to_string()),
            503 => Self::ServiceUnavailable(err.to_string()),
            _ => {
                error!(error = %err, "Request failed");
                Self::Internal(err.to_string())
            },
        }
    }
}
