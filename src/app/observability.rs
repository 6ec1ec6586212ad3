//! Metrics and probes over plain HTTP.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::{Network, ObservabilityConfig};
use crate::errors::Error;
use crate::metrics::render;

#[derive(Clone)]
struct ProbeState {
    registry: prometheus::Registry,
    ready: Arc<AtomicBool>,
}

pub fn router(registry: prometheus::Registry, ready: Arc<AtomicBool>) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/liveness", get(liveness))
        .route("/readiness", get(readiness))
        .layer(TraceLayer::new_for_http())
        .with_state(ProbeState { registry, ready })
}

async fn metrics(State(state): State<ProbeState>) -> impl IntoResponse {
    match render(&state.registry) {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", prometheus::TEXT_FORMAT)],
            body,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to render metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn liveness() -> StatusCode {
    StatusCode::OK
}

async fn readiness(State(state): State<ProbeState>) -> StatusCode {
    if state.ready.load(Ordering::Relaxed) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Bound observability listener.
pub enum HttpListener {
    Tcp(tokio::net::TcpListener),
    Unix(tokio::net::UnixListener),
}

impl HttpListener {
    pub async fn bind(cfg: &ObservabilityConfig) -> Result<Self, Error> {
        match cfg.network {
            Network::Tcp => Ok(Self::Tcp(tokio::net::TcpListener::bind(&cfg.address).await?)),
            Network::Unix => {
                if let Err(e) = std::fs::remove_file(&cfg.address) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        return Err(e.into());
                    }
                }
                Ok(Self::Unix(tokio::net::UnixListener::bind(&cfg.address)?))
            }
        }
    }

    pub fn local_addr(&self) -> String {
        match self {
            Self::Tcp(l) => l.local_addr().map_or_else(|_| "tcp:?".to_string(), |a| a.to_string()),
            Self::Unix(_) => "unix".to_string(),
        }
    }
}

pub async fn serve(listener: HttpListener, router: Router, shutdown: CancellationToken) {
    info!(server = "observability", address = %listener.local_addr(), "Listening");
    let result = match listener {
        HttpListener::Tcp(l) => {
            axum::serve(l, router)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
        }
        HttpListener::Unix(l) => {
            axum::serve(l, router)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
        }
    };
    if let Err(e) = result {
        warn!(server = "observability", error = %e, "Server error");
    }
    info!(server = "observability", "Stopped");
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::metrics::Metrics;

    async fn get_status(router: Router, path: &str) -> (StatusCode, String) {
        let resp = router
            .oneshot(Request::get(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = http_body_util::BodyExt::collect(resp.into_body())
            .await
            .unwrap()
            .to_bytes();
        (status, String::from_utf8_lossy(&body).into_owned())
    }

    #[tokio::test]
    async fn test_probes() {
        let registry = prometheus::Registry::new();
        let ready = Arc::new(AtomicBool::new(false));
        let r = router(registry, ready.clone());
        assert_eq!(get_status(r.clone(), "/liveness").await.0, StatusCode::OK);
        assert_eq!(get_status(r.clone(), "/readiness").await.0, StatusCode::SERVICE_UNAVAILABLE);
        ready.store(true, Ordering::Relaxed);
        assert_eq!(get_status(r, "/readiness").await.0, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_rendered() {
        let registry = prometheus::Registry::new();
        let m = Metrics::new(&registry).unwrap();
        m.routing_timeout.inc();
        let (status, body) = get_status(router(registry, Arc::new(AtomicBool::new(true))), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("routing_timeout_total 1"), "{body}");
    }
}
