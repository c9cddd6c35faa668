//! Configuration loading and management.
//!
//! Supports TOML configuration files with environment variable overrides.
//! Environment variables follow the pattern: `PUSHER_<SECTION>_<KEY>`

use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::Result;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Feedback listener configuration.
    pub feedback: FeedbackConfig,

    /// APNs push queue configuration.
    pub apns: ApnsConfig,

    /// Health check server configuration.
    pub health: HealthConfig,

    /// Metrics configuration.
    pub metrics: MetricsConfig,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// Feedback listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedbackConfig {
    /// Seconds to wait for in-flight messages to drain on shutdown.
    #[serde(default = "default_graceful_shutdown_timeout")]
    pub graceful_shutdown_timeout: u64,

    /// Kafka queue configuration.
    pub queue: QueueConfig,

    /// Broker worker pool configuration.
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Invalid-token handler configuration.
    pub invalid_token: InvalidTokenConfig,
}

fn default_graceful_shutdown_timeout() -> u64 {
    1
}

impl FeedbackConfig {
    /// Bounded wait applied to the pending-work drain on shutdown.
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_shutdown_timeout)
    }
}

/// Kafka consumer configuration for the feedback queue.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Kafka bootstrap servers, comma separated.
    pub brokers: String,

    /// Consumer group id.
    #[serde(default = "default_queue_group")]
    pub group: String,

    /// Topic subscriptions. Entries starting with `^` are regex patterns.
    #[serde(default = "default_queue_topics")]
    pub topics: Vec<String>,

    /// Capacity of the in-process messages channel.
    #[serde(default = "default_queue_channel_size")]
    pub channel_size: usize,

    /// Kafka session timeout in milliseconds.
    #[serde(default = "default_queue_session_timeout_ms")]
    pub session_timeout_ms: u64,
}

fn default_queue_group() -> String {
    "pushgate-feedbacks".to_string()
}

fn default_queue_topics() -> Vec<String> {
    vec!["^push-.*-feedbacks".to_string()]
}

fn default_queue_channel_size() -> usize {
    100
}

fn default_queue_session_timeout_ms() -> u64 {
    6000
}

/// Broker worker pool configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Number of broker workers. Defaults to the number of CPUs.
    #[serde(default = "default_broker_workers")]
    pub workers: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            workers: default_broker_workers(),
        }
    }
}

fn default_broker_workers() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(4)
}

/// Invalid-token handler configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct InvalidTokenConfig {
    /// Postgres connection URL for the user-device tables.
    pub database_url: String,

    /// Maximum events per flush batch.
    #[serde(default = "default_invalid_token_buffer_size")]
    pub buffer_size: usize,

    /// Upper bound in seconds between flushes.
    #[serde(default = "default_invalid_token_flush_interval")]
    pub flush_interval: u64,

    /// Per-batch delete retry count.
    #[serde(default = "default_invalid_token_max_retries")]
    pub max_retries: u32,
}

fn default_invalid_token_buffer_size() -> usize {
    1000
}

fn default_invalid_token_flush_interval() -> u64 {
    5
}

fn default_invalid_token_max_retries() -> u32 {
    3
}

impl InvalidTokenConfig {
    /// Upper bound between flushes.
    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval)
    }
}

/// APNs push queue configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ApnsConfig {
    /// Path to the .p8 private key file for token auth.
    #[serde(default)]
    pub auth_key_path: String,

    /// Key ID for token-based auth.
    #[serde(default)]
    pub key_id: String,

    /// Team ID for token-based auth.
    #[serde(default)]
    pub team_id: String,

    /// APNs environment: "production" or "development".
    #[serde(default = "default_apns_environment")]
    pub environment: String,

    /// Default apns-topic (the app bundle id) attached to notifications.
    #[serde(default)]
    pub topic: String,

    /// Number of pooled APNs clients.
    #[serde(default = "default_apns_connection_pool_size")]
    pub connection_pool_size: usize,

    /// Number of concurrent push workers.
    #[serde(default = "default_apns_concurrent_workers")]
    pub concurrent_workers: usize,
}

fn default_apns_environment() -> String {
    "production".to_string()
}

fn default_apns_connection_pool_size() -> usize {
    2
}

fn default_apns_concurrent_workers() -> usize {
    4
}

impl ApnsConfig {
    /// Returns true if targeting the production APNs environment.
    #[must_use]
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    /// Returns the APNs base URL for the configured environment.
    #[must_use]
    pub fn base_url(&self) -> &'static str {
        if self.is_production() {
            "https://api.push.apple.com"
        } else {
            "https://api.sandbox.push.apple.com"
        }
    }
}

/// Health check server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Whether the health check server is enabled.
    #[serde(default = "default_health_enabled")]
    pub enabled: bool,

    /// Bind address for the health check server.
    #[serde(default = "default_health_bind_address")]
    pub bind_address: String,
}

fn default_health_enabled() -> bool {
    true
}

fn default_health_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics are enabled.
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
}

fn default_metrics_enabled() -> bool {
    true
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error", "off".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "pretty".
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl AppConfig {
    /// Load configuration from a file path with environment variable overrides.
    ///
    /// Environment variables follow the pattern: `PUSHER_<SECTION>_<KEY>`
    /// For example: `PUSHER_FEEDBACK_QUEUE_BROKERS`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Config::builder()
            // Start with default values
            .set_default("feedback.graceful_shutdown_timeout", 1)?
            .set_default("feedback.queue.brokers", "")?
            .set_default("feedback.queue.group", "pushgate-feedbacks")?
            .set_default("feedback.queue.topics", vec!["^push-.*-feedbacks".to_string()])?
            .set_default("feedback.queue.channel_size", 100)?
            .set_default("feedback.queue.session_timeout_ms", 6000)?
            .set_default("feedback.broker.workers", default_broker_workers() as i64)?
            .set_default("feedback.invalid_token.database_url", "")?
            .set_default("feedback.invalid_token.buffer_size", 1000)?
            .set_default("feedback.invalid_token.flush_interval", 5)?
            .set_default("feedback.invalid_token.max_retries", 3)?
            .set_default("apns.auth_key_path", "")?
            .set_default("apns.key_id", "")?
            .set_default("apns.team_id", "")?
            .set_default("apns.environment", "production")?
            .set_default("apns.topic", "")?
            .set_default("apns.connection_pool_size", 2)?
            .set_default("apns.concurrent_workers", 4)?
            .set_default("health.enabled", true)?
            .set_default("health.bind_address", "0.0.0.0:8080")?
            .set_default("metrics.enabled", true)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "json")?
            // Load from config file
            .add_source(File::from(path.as_ref()))
            // Override with environment variables
            .add_source(
                Environment::with_prefix("PUSHER")
                    .separator("_")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}
