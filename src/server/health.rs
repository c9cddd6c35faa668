//! Health check HTTP server.
//!
//! Provides `/health` (liveness), `/ready` (readiness) and `/metrics`
//! (Prometheus text) endpoints. Readiness probes the database with a live
//! round trip on every request.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use sqlx::PgPool;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::info;

use crate::config::HealthConfig;
use crate::error::Result;
use crate::metrics::Metrics;

/// Upper bound on the readiness database round trip.
const DATABASE_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Readiness flags shared with the components that own them.
#[derive(Debug, Default)]
pub struct ReadyState {
    consumer_running: AtomicBool,
    apns_configured: AtomicBool,
}

impl ReadyState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_consumer_running(&self, running: bool) {
        self.consumer_running.store(running, Ordering::Release);
    }

    pub fn set_apns_configured(&self, configured: bool) {
        self.apns_configured.store(configured, Ordering::Release);
    }

    pub fn consumer_running(&self) -> bool {
        self.consumer_running.load(Ordering::Acquire)
    }

    pub fn apns_configured(&self) -> bool {
        self.apns_configured.load(Ordering::Acquire)
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
struct HealthResponse {
    status: String,
}

/// Readiness check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
struct ReadyResponse {
    status: String,
    consumer_running: bool,
    database_reachable: bool,
    apns_configured: bool,
}

/// Shared state for health check handlers.
struct HealthState {
    ready: Arc<ReadyState>,
    database: PgPool,
    metrics: Option<Metrics>,
}

/// Health check HTTP server.
pub struct HealthServer {
    config: HealthConfig,
    ready: Arc<ReadyState>,
    database: PgPool,
    metrics: Option<Metrics>,
}

impl HealthServer {
    /// Create a new health server.
    pub fn new(
        config: HealthConfig,
        ready: Arc<ReadyState>,
        database: PgPool,
        metrics: Option<Metrics>,
    ) -> Self {
        Self {
            config,
            ready,
            database,
            metrics,
        }
    }

    /// Run the health server until shutdown is signaled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        if !self.config.enabled {
            info!("Health server disabled");
            let _ = shutdown.changed().await;
            return Ok(());
        }

        let state = Arc::new(HealthState {
            ready: self.ready.clone(),
            database: self.database.clone(),
            metrics: self.metrics.clone(),
        });

        let app = Router::new()
            .route("/health", get(health_handler))
            .route("/ready", get(ready_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state);

        let listener = TcpListener::bind(&self.config.bind_address)
            .await
            .map_err(|e| {
                std::io::Error::new(
                    e.kind(),
                    format!(
                        "Failed to bind health server to '{}': {}",
                        self.config.bind_address, e
                    ),
                )
            })?;
        info!(address = %self.config.bind_address, "Health server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
                info!("Health server shutting down");
            })
            .await?;

        Ok(())
    }
}

/// Liveness check handler.
async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// Probe the database with a bounded round trip.
async fn database_reachable(pool: &PgPool) -> bool {
    matches!(
        timeout(DATABASE_PROBE_TIMEOUT, sqlx::query("SELECT 1").execute(pool)).await,
        Ok(Ok(_))
    )
}

/// Readiness check handler.
async fn ready_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let consumer_running = state.ready.consumer_running();
    let database_reachable = database_reachable(&state.database).await;
    let apns_configured = state.ready.apns_configured();

    let is_ready = consumer_running && database_reachable;

    let response = ReadyResponse {
        status: if is_ready { "ready" } else { "not_ready" }.to_string(),
        consumer_running,
        database_reachable,
        apns_configured,
    };

    if is_ready {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

/// Prometheus metrics handler.
async fn metrics_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let Some(metrics) = &state.metrics else {
        return (StatusCode::NOT_FOUND, "metrics disabled".to_string());
    };

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    match encoder.encode(&metrics.gather(), &mut buffer) {
        Ok(()) => match String::from_utf8(buffer) {
            Ok(body) => (StatusCode::OK, body),
            Err(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("metrics encoding error: {e}"),
            ),
        },
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("metrics encoding error: {e}"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;

    /// A pool pointed at nothing, with a short acquire timeout so probes
    /// fail fast.
    fn unreachable_pool() -> PgPool {
        PgPoolOptions::new()
            .acquire_timeout(Duration::from_millis(100))
            .connect_lazy("postgres://pushgate@127.0.0.1:1/void")
            .unwrap()
    }

    async fn spawn_server(
        ready: Arc<ReadyState>,
        database: PgPool,
        metrics: Option<Metrics>,
    ) -> (String, watch::Sender<bool>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let config = HealthConfig {
            enabled: true,
            bind_address: address.clone(),
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = HealthServer::new(config, ready, database, metrics);

        tokio::spawn(async move {
            server.run(shutdown_rx).await.unwrap();
        });

        // Give the server a moment to bind.
        tokio::time::sleep(Duration::from_millis(100)).await;
        (format!("http://{address}"), shutdown_tx)
    }

    #[test]
    fn test_ready_response_serialization() {
        let response = ReadyResponse {
            status: "ready".to_string(),
            consumer_running: true,
            database_reachable: true,
            apns_configured: false,
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("ready"));
        assert!(json.contains("database_reachable"));
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (base, shutdown) = spawn_server(ReadyState::new(), unreachable_pool(), None).await;

        let response = reqwest::get(format!("{base}/health")).await.unwrap();
        assert_eq!(response.status(), 200);

        let body: HealthResponse = response.json().await.unwrap();
        assert_eq!(body.status, "ok");

        shutdown.send(true).unwrap();
    }

    #[tokio::test]
    async fn test_ready_not_ready_when_consumer_stopped() {
        let (base, shutdown) = spawn_server(ReadyState::new(), unreachable_pool(), None).await;

        let response = reqwest::get(format!("{base}/ready")).await.unwrap();
        assert_eq!(response.status(), 503);
        let body: ReadyResponse = response.json().await.unwrap();
        assert_eq!(body.status, "not_ready");
        assert!(!body.consumer_running);

        shutdown.send(true).unwrap();
    }

    #[tokio::test]
    async fn test_ready_reports_unreachable_database() {
        let ready = ReadyState::new();
        ready.set_consumer_running(true);
        ready.set_apns_configured(true);
        let (base, shutdown) = spawn_server(ready, unreachable_pool(), None).await;

        // The consumer flag alone is not enough; a dead database must keep
        // the server not ready.
        let response = reqwest::get(format!("{base}/ready")).await.unwrap();
        assert_eq!(response.status(), 503);
        let body: ReadyResponse = response.json().await.unwrap();
        assert!(body.consumer_running);
        assert!(!body.database_reachable);
        assert!(body.apns_configured);

        shutdown.send(true).unwrap();
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let metrics = Metrics::new().unwrap();
        metrics.record_feedback_received();
        let (base, shutdown) =
            spawn_server(ReadyState::new(), unreachable_pool(), Some(metrics)).await;

        let response = reqwest::get(format!("{base}/metrics")).await.unwrap();
        assert_eq!(response.status(), 200);
        let body = response.text().await.unwrap();
        assert!(body.contains("pushgate_feedback_received_total"));

        shutdown.send(true).unwrap();
    }

    #[tokio::test]
    async fn test_metrics_endpoint_disabled() {
        let (base, shutdown) = spawn_server(ReadyState::new(), unreachable_pool(), None).await;

        let response = reqwest::get(format!("{base}/metrics")).await.unwrap();
        assert_eq!(response.status(), 404);

        shutdown.send(true).unwrap();
    }

    #[tokio::test]
    async fn test_disabled_server_waits_for_shutdown() {
        let config = HealthConfig {
            enabled: false,
            bind_address: "127.0.0.1:0".to_string(),
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = HealthServer::new(config, ReadyState::new(), unreachable_pool(), None);

        let handle = tokio::spawn(async move { server.run(shutdown_rx).await });
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
