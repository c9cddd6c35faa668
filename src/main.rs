//! pushgate — push-notification feedback gateway.
//!
//! Consumes per-game push feedback from Kafka, removes invalidated device
//! tokens from the per-game Postgres tables, and serves an APNs push queue
//! over a pool of authenticated HTTP/2 clients.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use pushgate::config::{AppConfig, LoggingConfig};
use pushgate::feedback::Listener;
use pushgate::metrics::Metrics;
use pushgate::push::ApnsPushQueue;
use pushgate::server::{HealthServer, ReadyState};

/// pushgate — push-notification feedback gateway
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/default.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = AppConfig::load(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config))?;

    // Initialize logging
    init_logging(&config.logging)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config_path = %args.config,
        "Starting pushgate"
    );

    // Validate configuration
    if config.feedback.queue.brokers.is_empty() {
        anyhow::bail!("feedback.queue.brokers is required");
    }
    if config.feedback.invalid_token.database_url.is_empty() {
        anyhow::bail!("feedback.invalid_token.database_url is required");
    }

    let metrics = Metrics::new().context("Failed to create metrics registry")?;
    metrics.init_server_info(env!("CARGO_PKG_VERSION"));

    let ready = ReadyState::new();

    // Build the feedback listener
    let listener = Arc::new(
        Listener::new(&config.feedback, metrics.clone())
            .context("Failed to create feedback listener")?,
    );

    // Configure the APNs push queue when a signing key is provided
    let push_queue = if config.apns.auth_key_path.is_empty() {
        debug!("APNs push queue disabled (no auth key configured)");
        None
    } else {
        let queue = Arc::new(ApnsPushQueue::new(config.apns.clone(), metrics.clone()));
        queue
            .configure()
            .await
            .context("Failed to configure APNs push queue")?;
        info!("APNs push queue configured");
        ready.set_apns_configured(true);
        Some(queue)
    };

    // Drain push responses into the log
    if let Some(queue) = &push_queue {
        let responses = queue.responses();
        tokio::spawn(async move {
            while let Ok(response) = responses.recv().await {
                if response.sent {
                    debug!(apns_id = %response.apns_id, "push delivered");
                } else {
                    warn!(
                        status = response.status_code,
                        reason = %response.reason,
                        device_token_prefix = %response.device_token.chars().take(8).collect::<String>(),
                        "push rejected"
                    );
                }
            }
        });
    }

    // Start the health server on the listener's stop signal
    let health_server = HealthServer::new(
        config.health.clone(),
        ready.clone(),
        listener.database_pool(),
        config.metrics.enabled.then(|| metrics.clone()),
    );
    let health_shutdown = listener.stop_signal();
    let health_handle = tokio::spawn(async move {
        if let Err(e) = health_server.run(health_shutdown).await {
            error!(error = %e, "Health server error");
        }
    });

    info!("pushgate running");
    ready.set_consumer_running(true);

    // Consume until a termination signal arrives, then drain
    listener.run().await;

    ready.set_consumer_running(false);

    if let Some(queue) = &push_queue {
        queue.close();
    }

    let _ = health_handle.await;

    info!("pushgate stopped");
    Ok(())
}

/// Initialize the tracing subscriber based on configuration.
fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        "pretty" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().pretty())
                .init();
        }
        "off" => {
            // No logging
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }

    Ok(())
}
